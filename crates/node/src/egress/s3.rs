//! Object-store sink. Authentication is ambient (instance role or
//! environment), as on the nodes this engine is deployed to.

use std::path::Path;

use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use tracing::info;

use common::manifest::S3Sink;

use super::{collect_files, SinkError};

/// Upload every selected artifact into the configured bucket with key
/// `<path>/<basename>`. Returns the number of uploaded objects.
pub async fn transfer(sink: &S3Sink, results_dir: &Path) -> Result<usize, SinkError> {
    let files = collect_files(results_dir, &sink.results);
    if files.is_empty() {
        return Ok(0);
    }

    let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let client = aws_sdk_s3::Client::new(&config);

    let mut uploaded = 0;
    for (path, basename) in files {
        let key = format!("{}/{}", sink.path.trim_end_matches('/'), basename);
        let body = ByteStream::from_path(&path)
            .await
            .map_err(|e| SinkError::ObjectStore(e.to_string()))?;
        client
            .put_object()
            .bucket(&sink.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::ObjectStore(e.to_string()))?;
        uploaded += 1;
    }
    info!(bucket = %sink.bucket, uploaded, "artifacts delivered to object store");
    Ok(uploaded)
}
