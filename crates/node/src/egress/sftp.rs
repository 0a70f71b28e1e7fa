//! SFTP sink: one connection per delivery, password auth, every selected
//! artifact uploaded under the configured remote path.

use std::path::Path;
use std::sync::Arc;

use russh::client;
use russh::keys::ssh_key::PublicKey;
use tokio::io::AsyncWriteExt;
use tracing::info;

use common::manifest::SftpSink;

use super::{collect_files, SinkError};

struct TrustAnyHost;

impl client::Handler for TrustAnyHost {
    type Error = russh::Error;

    // Peer nodes are provisioned out of band; the host key is not pinned.
    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

fn sftp_err(e: impl std::fmt::Display) -> SinkError {
    SinkError::Sftp(e.to_string())
}

/// Returns the number of uploaded files.
pub async fn transfer(sink: &SftpSink, results_dir: &Path) -> Result<usize, SinkError> {
    let files = collect_files(results_dir, &sink.results);
    if files.is_empty() {
        return Ok(0);
    }

    let config = Arc::new(client::Config::default());
    let mut session = client::connect(config, (sink.host.as_str(), sink.port), TrustAnyHost)
        .await
        .map_err(sftp_err)?;
    let auth = session
        .authenticate_password(&sink.username, &sink.password)
        .await
        .map_err(sftp_err)?;
    if !matches!(auth, russh::client::AuthResult::Success) {
        return Err(SinkError::Sftp(format!(
            "authentication rejected for {}@{}",
            sink.username, sink.host
        )));
    }

    let channel = session.channel_open_session().await.map_err(sftp_err)?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(sftp_err)?;
    let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
        .await
        .map_err(sftp_err)?;

    let dest_root = sink.dest_path.trim_end_matches('/');
    let mut uploaded = 0;
    for (path, basename) in files {
        let remote = format!("{dest_root}/{basename}");
        let data = tokio::fs::read(&path).await?;
        let mut file = sftp.create(&remote).await.map_err(sftp_err)?;
        file.write_all(&data).await.map_err(sftp_err)?;
        file.shutdown().await.map_err(sftp_err)?;
        uploaded += 1;
    }

    sftp.close().await.map_err(sftp_err)?;
    session
        .disconnect(russh::Disconnect::ByApplication, "done", "en")
        .await
        .map_err(sftp_err)?;
    info!(host = %sink.host, uploaded, "artifacts delivered over sftp");
    Ok(uploaded)
}
