use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

use common::manifest::NifiSink;
use common::reqname;

use crate::results::{copy_tree, expand_pattern};

pub mod nifi;
pub mod s3;
pub mod sftp;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("object store: {0}")]
    ObjectStore(String),
    #[error("sftp: {0}")]
    Sftp(String),
    #[error("cross-site transport: {0}")]
    Transport(#[from] nifi::TransportError),
    #[error("egress io: {0}")]
    Io(#[from] std::io::Error),
}

/// Receipt for one packaged cross-site artifact.
#[derive(Debug, Clone)]
pub struct PackagedArtifact {
    pub path: PathBuf,
    pub file_name: String,
    pub sha256: String,
}

/// Files a sink should deliver, as `(absolute path, basename key)` pairs.
/// With declared patterns only the matches are delivered, directories walked
/// recursively; with none, the whole results tree goes.
pub fn collect_files(results_dir: &Path, patterns: &[String]) -> Vec<(PathBuf, String)> {
    let mut files = Vec::new();
    if patterns.is_empty() {
        push_tree(results_dir, &mut files);
        return files;
    }
    for pattern in patterns {
        for found in expand_pattern(results_dir, pattern) {
            if found.is_file() {
                push_file(&found, &mut files);
            } else if found.is_dir() {
                push_tree(&found, &mut files);
            }
        }
    }
    files
}

fn push_tree(root: &Path, files: &mut Vec<(PathBuf, String)>) {
    for entry in WalkDir::new(root).into_iter().flatten() {
        if entry.file_type().is_file() {
            push_file(entry.path(), files);
        }
    }
}

fn push_file(path: &Path, files: &mut Vec<(PathBuf, String)>) {
    if let Some(name) = path.file_name() {
        files.push((path.to_path_buf(), name.to_string_lossy().to_string()));
    }
}

/// Stage the sink's artifacts under `results/<archname>/`, zip the staging
/// directory, and rename the archive to `<archname>.<artifact_id>.zip` for
/// trace correlation. The staging directory is removed afterwards.
pub fn package_for_transport(
    results_dir: &Path,
    sink: &NifiSink,
    artifact_id: &str,
) -> Result<PackagedArtifact, SinkError> {
    let staging = results_dir.join(&sink.archname);
    fs::create_dir_all(&staging)?;

    if sink.results.is_empty() {
        for entry in WalkDir::new(results_dir)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| e.path() != staging)
            .flatten()
        {
            let rel = entry
                .path()
                .strip_prefix(results_dir)
                .map_err(|e| SinkError::ObjectStore(e.to_string()))?;
            let dest = staging.join(rel);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest)?;
            } else if entry.file_type().is_file() {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &dest)?;
            }
        }
    } else {
        for pattern in &sink.results {
            for found in expand_pattern(results_dir, pattern) {
                if found == staging {
                    continue;
                }
                if found.is_file() {
                    let name = found.file_name().unwrap_or_default();
                    fs::copy(&found, staging.join(name))?;
                } else if found.is_dir() {
                    let name = found.file_name().unwrap_or_default();
                    copy_tree(&found, &staging.join(name))
                        .map_err(|e| SinkError::ObjectStore(e.to_string()))?;
                }
            }
        }
    }

    let plain = results_dir.join(format!("{}.zip", sink.archname));
    zip_dir(&staging, &sink.archname, &plain)?;
    fs::remove_dir_all(&staging)?;

    let tagged_name = reqname::tagged_archive(&sink.archname, artifact_id);
    let tagged = results_dir.join(&tagged_name);
    fs::rename(&plain, &tagged)?;

    let sha256 = sha256_file(&tagged)?;
    Ok(PackagedArtifact {
        path: tagged,
        file_name: tagged_name,
        sha256,
    })
}

fn zip_dir(src: &Path, prefix: &str, dest: &Path) -> Result<(), SinkError> {
    let file = fs::File::create(dest)?;
    let mut zip = zip::ZipWriter::new(file);
    let opts = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for entry in WalkDir::new(src).min_depth(1).into_iter().flatten() {
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| SinkError::ObjectStore(e.to_string()))?;
        let name = format!("{prefix}/{}", rel.display());
        if entry.file_type().is_dir() {
            zip.add_directory(name, opts)
                .map_err(|e| SinkError::ObjectStore(e.to_string()))?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, opts)
                .map_err(|e| SinkError::ObjectStore(e.to_string()))?;
            let mut f = fs::File::open(entry.path())?;
            io::copy(&mut f, &mut zip)?;
        }
    }
    zip.finish().map_err(|e| SinkError::ObjectStore(e.to_string()))?;
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, SinkError> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Ship a packaged artifact through the cross-site transport, bounded by
/// `ttl_secs`. The local archive is removed afterwards whether or not the
/// send succeeded.
pub async fn cross_site_transfer(
    transport: &dyn nifi::CrossSiteTransport,
    sink: &NifiSink,
    results_dir: &Path,
    artifact_id: &str,
    ttl_secs: u64,
) -> Result<PackagedArtifact, SinkError> {
    let artifact = package_for_transport(results_dir, sink, artifact_id)?;
    let send = transport.send_file(&sink.target_uri, &sink.target_remote_input_port, &artifact.path);
    let outcome = match tokio::time::timeout(std::time::Duration::from_secs(ttl_secs), send).await
    {
        Ok(res) => res.map_err(SinkError::from),
        Err(_) => Err(SinkError::Transport(nifi::TransportError::Timeout)),
    };
    if artifact.path.is_file() {
        if let Err(e) = fs::remove_file(&artifact.path) {
            warn!(artifact = %artifact.file_name, error = %e, "failed to remove shipped archive");
        }
    }
    outcome.map(|_| artifact)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use common::manifest::TransferRule;

    use super::nifi::FakeTransport;
    use super::*;

    fn sink(archname: &str, results: Vec<String>) -> NifiSink {
        NifiSink {
            transfer: TransferRule {
                condition: "all".to_string(),
            },
            target_uri: "https://downstream.example:8443/nifi".to_string(),
            target_remote_input_port: "intake".to_string(),
            archname: archname.to_string(),
            results,
        }
    }

    fn results_fixture() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let results = dir.path().join("results");
        fs::create_dir_all(results.join("plots")).unwrap();
        fs::write(results.join("out.csv"), "a,b").unwrap();
        fs::write(results.join("summary.txt"), "ok").unwrap();
        fs::write(results.join("plots/p.png"), "img").unwrap();
        (dir, results)
    }

    #[test]
    fn collects_declared_patterns_only() {
        let (_dir, results) = results_fixture();
        let files = collect_files(&results, &["out.csv".to_string(), "plots".to_string()]);
        let names: HashSet<String> = files.into_iter().map(|(_, n)| n).collect();
        assert_eq!(
            names,
            HashSet::from(["out.csv".to_string(), "p.png".to_string()])
        );
    }

    #[test]
    fn collects_whole_tree_without_patterns() {
        let (_dir, results) = results_fixture();
        let files = collect_files(&results, &[]);
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn packages_a_tagged_archive_and_cleans_staging() {
        let (_dir, results) = results_fixture();
        let sink = sink("res", vec!["out.csv".to_string()]);
        let artifact = package_for_transport(&results, &sink, "7f3a").unwrap();

        assert_eq!(artifact.file_name, "res.7f3a.zip");
        assert!(artifact.path.is_file());
        assert!(!results.join("res").exists());
        assert_eq!(artifact.sha256.len(), 64);

        let mut archive = zip::ZipArchive::new(fs::File::open(&artifact.path).unwrap()).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"res/out.csv".to_string()));
    }

    #[tokio::test]
    async fn cross_site_transfer_ships_and_removes_the_archive() {
        let (_dir, results) = results_fixture();
        let sink = sink("res", vec![]);
        let transport = FakeTransport::default();

        let artifact = cross_site_transfer(&transport, &sink, &results, "42", 30)
            .await
            .unwrap();

        assert_eq!(artifact.file_name, "res.42.zip");
        assert!(!artifact.path.exists());
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].ends_with("res.42.zip"));
    }
}
