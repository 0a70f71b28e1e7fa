use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::GlobBuilder;
use indexmap::IndexMap;
use tracing::{info, warn};
use walkdir::WalkDir;

use common::manifest::{ResultAction, ResultStep};

/// Expand an artifact pattern against `root`, returning matching files and
/// directories. Patterns are globs matched against paths relative to `root`.
pub fn expand_pattern(root: &Path, pattern: &str) -> Vec<PathBuf> {
    // `*` does not cross directory separators, so a pattern only matches at
    // its own depth.
    let matcher = match GlobBuilder::new(pattern).literal_separator(true).build() {
        Ok(g) => g.compile_matcher(),
        Err(e) => {
            warn!(pattern, error = %e, "invalid artifact pattern");
            return Vec::new();
        }
    };
    let mut matches = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).into_iter().flatten() {
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        if matcher.is_match(rel) {
            matches.push(entry.path().to_path_buf());
        }
    }
    matches
}

/// After a service iteration completes, run the ordered action list for each
/// declared artifact pattern, landing artifacts in the results directory.
/// Absent matches are logged, not failed.
pub fn act_on_results(
    results: &IndexMap<String, Vec<ResultStep>>,
    req_dir: &Path,
    results_dir: &Path,
) -> Result<()> {
    for (pattern, steps) in results {
        let matches = expand_pattern(req_dir, pattern);
        if matches.is_empty() {
            info!(pattern, "no artifacts matched result pattern");
            continue;
        }
        for found in matches {
            let dest = results_dir.join(pattern);
            if found.is_file() {
                for step in steps {
                    match step.action {
                        ResultAction::Copy => {
                            fs::copy(&found, &dest).with_context(|| {
                                format!("copying {} to {}", found.display(), dest.display())
                            })?;
                        }
                        ResultAction::Move => {
                            if dest.exists() {
                                fs::remove_file(&dest)?;
                            }
                            fs::rename(&found, &dest).with_context(|| {
                                format!("moving {} to {}", found.display(), dest.display())
                            })?;
                        }
                    }
                }
            } else if found.is_dir() {
                // A stale copy of the directory is dropped before the fresh
                // one lands.
                if dest.is_dir() {
                    fs::remove_dir_all(&dest)?;
                }
                for step in steps {
                    match step.action {
                        ResultAction::Copy => {
                            copy_tree(&found, &dest)?;
                        }
                        ResultAction::Move => {
                            fs::rename(&found, &dest).with_context(|| {
                                format!("moving {} to {}", found.display(), dest.display())
                            })?;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Delete everything matching the given patterns under the request directory
/// so the next iteration starts against freshly regenerated inputs.
pub fn remove_stale(patterns: &[String], req_dir: &Path) -> Result<()> {
    for pattern in patterns {
        for found in expand_pattern(req_dir, pattern) {
            if found.is_file() {
                fs::remove_file(&found)
                    .with_context(|| format!("removing {}", found.display()))?;
            } else if found.is_dir() {
                fs::remove_dir_all(&found)
                    .with_context(|| format!("removing {}", found.display()))?;
            }
        }
    }
    Ok(())
}

pub(crate) fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    let opts = fs_extra::dir::CopyOptions::new()
        .copy_inside(true)
        .overwrite(true);
    fs_extra::dir::copy(src, dest, &opts)
        .with_context(|| format!("copying {} to {}", src.display(), dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(actions: &[ResultAction]) -> Vec<ResultStep> {
        actions.iter().map(|a| ResultStep { action: *a }).collect()
    }

    fn fixture() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let req = dir.path().join("req");
        let results = req.join("results");
        fs::create_dir_all(&results).unwrap();
        (dir, req, results)
    }

    #[test]
    fn move_lands_the_artifact_and_clears_the_source() {
        let (_dir, req, results) = fixture();
        fs::write(req.join("out.csv"), "a,b").unwrap();

        let conf = IndexMap::from([("out.csv".to_string(), steps(&[ResultAction::Move]))]);
        act_on_results(&conf, &req, &results).unwrap();

        assert!(!req.join("out.csv").exists());
        assert_eq!(fs::read_to_string(results.join("out.csv")).unwrap(), "a,b");
    }

    #[test]
    fn copy_keeps_the_source_and_overwrites_prior_results() {
        let (_dir, req, results) = fixture();
        fs::write(req.join("out.csv"), "new").unwrap();
        fs::write(results.join("out.csv"), "old").unwrap();

        let conf = IndexMap::from([("out.csv".to_string(), steps(&[ResultAction::Copy]))]);
        act_on_results(&conf, &req, &results).unwrap();

        assert!(req.join("out.csv").exists());
        assert_eq!(fs::read_to_string(results.join("out.csv")).unwrap(), "new");
    }

    #[test]
    fn directories_replace_stale_copies() {
        let (_dir, req, results) = fixture();
        fs::create_dir(req.join("plots")).unwrap();
        fs::write(req.join("plots/a.png"), "img").unwrap();
        fs::create_dir(results.join("plots")).unwrap();
        fs::write(results.join("plots/stale.png"), "x").unwrap();

        let conf = IndexMap::from([("plots".to_string(), steps(&[ResultAction::Move]))]);
        act_on_results(&conf, &req, &results).unwrap();

        assert!(!req.join("plots").exists());
        assert!(results.join("plots/a.png").is_file());
        assert!(!results.join("plots/stale.png").exists());
    }

    #[test]
    fn absent_patterns_are_not_fatal() {
        let (_dir, req, results) = fixture();
        let conf = IndexMap::from([("missing-*.csv".to_string(), steps(&[ResultAction::Move]))]);
        act_on_results(&conf, &req, &results).unwrap();
    }

    #[test]
    fn stale_inputs_are_removed_by_pattern() {
        let (_dir, req, _results) = fixture();
        fs::write(req.join("chunk-1.dat"), "x").unwrap();
        fs::write(req.join("chunk-2.dat"), "y").unwrap();
        fs::create_dir(req.join("scratch")).unwrap();
        fs::write(req.join("keep.txt"), "z").unwrap();

        remove_stale(
            &["chunk-*.dat".to_string(), "scratch".to_string()],
            &req,
        )
        .unwrap();

        assert!(!req.join("chunk-1.dat").exists());
        assert!(!req.join("chunk-2.dat").exists());
        assert!(!req.join("scratch").exists());
        assert!(req.join("keep.txt").exists());
    }

    #[test]
    fn globs_expand_to_every_match() {
        let (_dir, req, _results) = fixture();
        fs::write(req.join("part-1.csv"), "1").unwrap();
        fs::write(req.join("part-2.csv"), "2").unwrap();
        let mut found = expand_pattern(&req, "part-*.csv");
        found.sort();
        assert_eq!(found.len(), 2);
    }
}
