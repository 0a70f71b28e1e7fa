use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use common::{manifest, reqname};

use crate::config::SiteConfig;
use crate::spool;

/// One pass over the intake directories of the given sets: reconcile returning
/// requests, extract archives, normalize permissions, relocate metadata logs.
pub fn unpack_once(site: &SiteConfig, sets: &[String]) -> Result<()> {
    for key in sets {
        let set = site.set(key)?;
        let in_dir = site.in_dir(set);
        let finished_dir = site.finished_dir(set);

        let entries = fs::read_dir(&in_dir)
            .with_context(|| format!("listing intake directory {}", in_dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !reqname::is_archive(&name) {
                continue;
            }
            if let Err(e) = unpack_archive(site, &in_dir, &finished_dir, &name) {
                warn!(set = %key, archive = %name, error = %e, "failed to unpack request archive");
            }
        }
    }
    Ok(())
}

fn unpack_archive(site: &SiteConfig, in_dir: &Path, finished_dir: &Path, name: &str) -> Result<()> {
    let base = reqname::base_name(name);
    let archive_path = in_dir.join(name);

    // A finished copy of the same request returns to the intake directory and
    // gains one more iteration per service before the archive lands on top.
    let returning = finished_dir.join(base);
    if returning.is_dir() {
        let target = in_dir.join(base);
        fs::rename(&returning, &target)
            .with_context(|| format!("moving {} back to intake", returning.display()))?;
        let conf = target.join(site.manifest_name());
        manifest::increment_all_max_rep(&conf)
            .with_context(|| format!("raising iteration budgets in {}", conf.display()))?;
        info!(request = %base, "returned finished request to intake for one more round");
    }

    extract_into(&archive_path, in_dir)
        .with_context(|| format!("extracting {}", archive_path.display()))?;
    fs::remove_file(&archive_path)?;

    // The extracted root is `base`, or `base.uuid` for archives that kept
    // their trace segment in the tree name.
    let root = [base.to_string(), reqname::stem(name).to_string()]
        .into_iter()
        .map(|n| in_dir.join(n))
        .find(|p| p.is_dir());
    let Some(root) = root else {
        warn!(archive = %name, "archive produced no request directory");
        return Ok(());
    };

    spool::change_permissions_recursive(&root, spool::REQUEST_TREE_MODE);
    relocate_metadata_log(site, &root, base)?;
    info!(request = %base, root = %root.display(), "request unpacked");
    Ok(())
}

/// Extract an archive without overwriting files that already exist, so a
/// manifest merged back from `finished/` survives the overlay.
fn extract_into(archive_path: &Path, target: &Path) -> Result<()> {
    let file = fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(rel) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            warn!(archive = %archive_path.display(), index = i, "skipping entry with unsafe path");
            continue;
        };
        let dest = target.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&dest)?;
            continue;
        }
        if dest.exists() {
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&dest)?;
        io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

/// Move a `.log.yml`/`.log.yaml` metadata file shipped at the request root
/// into the audit directory for this request.
fn relocate_metadata_log(site: &SiteConfig, root: &Path, base: &str) -> Result<()> {
    for candidate in [".log.yml", ".log.yaml"] {
        let src = root.join(candidate);
        if src.is_file() {
            let dest_dir = site.req_log_path.join(base);
            fs::create_dir_all(&dest_dir)?;
            fs::rename(&src, dest_dir.join(candidate))?;
        }
    }
    Ok(())
}

pub async fn unpack_loop(site: &SiteConfig, sets: &[String], stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        if let Err(e) = unpack_once(site, sets) {
            warn!(error = %e, "unpack pass failed");
        }
        tokio::time::sleep(Duration::from_secs(site.domains.unpack_int)).await;
    }
    info!("unpack loop stopped");
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use common::manifest::{load_manifest, MaxRep};

    use super::*;
    use crate::config::tests::load_sample;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let opts = zip::write::FileOptions::default();
        for (name, body) in entries {
            zip.start_file(*name, opts).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    const CONF: &str = r#"
curserv: pre_services
services:
  sim:
    image: python:3.10
    cmd_eng: python
    script: sim.py
    iterative:
      max_rep: 2
      cur_iter: 0
"#;

    #[test]
    fn extracts_and_removes_archive() {
        let dir = tempfile::tempdir().unwrap();
        let site = load_sample(dir.path());
        let set = site.set("hydro").unwrap();
        let in_dir = site.in_dir(set);
        write_zip(
            &in_dir.join("flood.zip"),
            &[("flood/conf.yml", CONF), ("flood/sim.py", "print()")],
        );

        unpack_once(&site, &["hydro".into()]).unwrap();

        assert!(!in_dir.join("flood.zip").exists());
        assert!(in_dir.join("flood/conf.yml").is_file());
        assert!(in_dir.join("flood/sim.py").is_file());

        // A second pass with nothing new is a no-op.
        unpack_once(&site, &["hydro".into()]).unwrap();
        assert!(in_dir.join("flood/conf.yml").is_file());
    }

    #[test]
    fn returning_request_merges_and_gains_an_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let site = load_sample(dir.path());
        let set = site.set("hydro").unwrap();
        let in_dir = site.in_dir(set);
        let finished = site.finished_dir(set).join("flood");
        fs::create_dir_all(&finished).unwrap();
        let done = CONF.replace("cur_iter: 0", "cur_iter: 2");
        fs::write(finished.join("conf.yml"), done).unwrap();
        fs::write(finished.join("old-output.csv"), "1,2").unwrap();

        write_zip(
            &in_dir.join("flood.9a1c.zip"),
            &[("flood/conf.yml", CONF), ("flood/new-input.csv", "3,4")],
        );

        unpack_once(&site, &["hydro".into()]).unwrap();

        assert!(!site.finished_dir(set).join("flood").exists());
        let merged = in_dir.join("flood");
        assert!(merged.join("old-output.csv").is_file());
        assert!(merged.join("new-input.csv").is_file());

        let m = load_manifest(&merged.join("conf.yml")).unwrap();
        let it = m.services["sim"].iterative.as_ref().unwrap();
        assert_eq!(it.max_rep, MaxRep::Count(3));
        assert_eq!(it.cur_iter, 2);
    }

    #[test]
    fn metadata_log_moves_to_audit_directory() {
        let dir = tempfile::tempdir().unwrap();
        let site = load_sample(dir.path());
        let set = site.set("hydro").unwrap();
        let in_dir = site.in_dir(set);
        write_zip(
            &in_dir.join("flood.zip"),
            &[("flood/conf.yml", CONF), ("flood/.log.yml", "sender: upstream")],
        );

        unpack_once(&site, &["hydro".into()]).unwrap();

        assert!(!in_dir.join("flood/.log.yml").exists());
        assert!(site.req_log_path.join("flood/.log.yml").is_file());
    }
}
