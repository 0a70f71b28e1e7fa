use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

use common::manifest::{DepKind, Manifest, Service};

use crate::config::{Limit, SetConfig};

const DEFAULT_TASKS: u64 = 1;
const DEFAULT_TTL_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("image {image:?} is not allowed for this set")]
    ImageNotAllowed { image: String },
    #[error("unknown data source {name:?}")]
    UnknownDataSource { name: String },
    #[error("required input {path:?} is missing or has the wrong kind")]
    MissingInput { path: String },
}

/// Replica count and TTL after clamping against site policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clamped {
    pub tasks: u64,
    pub ttl: u64,
}

#[derive(Debug)]
pub enum AdmissionOutcome {
    Admitted(Clamped),
    /// Dependencies unmet; retry on the next scheduler tick.
    Deferred(String),
    Rejected(AdmissionError),
}

/// Admission checks for one (set, manifest, service) triple, in order:
/// image allow-list, data-mount modes, input files, service precedence,
/// function precedence, capacity clamp.
pub fn admit(
    set: &SetConfig,
    manifest: &Manifest,
    ser_name: &str,
    req_dir: &Path,
) -> AdmissionOutcome {
    let Some(service) = manifest.services.get(ser_name) else {
        return AdmissionOutcome::Rejected(AdmissionError::MissingInput {
            path: ser_name.to_string(),
        });
    };

    if !set.docker.allows_image(&service.image) {
        return AdmissionOutcome::Rejected(AdmissionError::ImageNotAllowed {
            image: service.image.clone(),
        });
    }

    // Data sources must exist; requested modes are accepted as-is for now,
    // this is the reserved enforcement point.
    for (name, mount) in &service.data {
        let Some(data) = set.data_dir.get(name) else {
            return AdmissionOutcome::Rejected(AdmissionError::UnknownDataSource {
                name: name.clone(),
            });
        };
        if !data.modes.is_empty() && !data.modes.contains(&mount.mode) {
            warn!(data = %name, mode = mount.mode.as_str(), "requested mode outside the declared set");
        }
        debug!(data = %name, mode = mount.mode.as_str(), "data mount accepted");
    }

    for (path, kind) in &service.dependencies.files {
        let full = req_dir.join(path);
        let ok = match kind {
            DepKind::File => full.is_file(),
            DepKind::Dir => full.is_dir(),
        };
        if !ok {
            return AdmissionOutcome::Rejected(AdmissionError::MissingInput { path: path.clone() });
        }
    }

    for pred in &service.dependencies.ser {
        match manifest.services.get(pred) {
            Some(p) if p.is_done(req_dir) => {}
            Some(_) => {
                return AdmissionOutcome::Deferred(format!(
                    "predecessor {pred:?} has iterations left"
                ));
            }
            None => {
                return AdmissionOutcome::Deferred(format!("predecessor {pred:?} not in manifest"));
            }
        }
    }

    if !function_precedence_satisfied(manifest, ser_name) {
        return AdmissionOutcome::Deferred("function precedence unmet".to_string());
    }

    AdmissionOutcome::Admitted(clamp(set, service, ser_name))
}

/// Reserved extension point; default accept.
fn function_precedence_satisfied(_manifest: &Manifest, _ser_name: &str) -> bool {
    true
}

fn clamp(set: &SetConfig, service: &Service, ser_name: &str) -> Clamped {
    let tasks = clamp_value(set.docker.docker_rep, service.tasks, DEFAULT_TASKS);
    if Some(tasks) != service.tasks && service.tasks.is_some() {
        warn!(service = %ser_name, tasks, "replica count clamped to site cap");
    }
    let ttl = clamp_value(set.docker.ttl, service.ser_check_thr, DEFAULT_TTL_SECS);
    if Some(ttl) != service.ser_check_thr && service.ser_check_thr.is_some() {
        warn!(service = %ser_name, ttl, "ttl clamped to site cap");
    }
    Clamped { tasks, ttl }
}

/// The requested value wins while it stays under the cap; `Any` means the
/// request (or the default) wins outright.
fn clamp_value(cap: Limit, requested: Option<u64>, default: u64) -> u64 {
    match cap {
        Limit::Any => requested.unwrap_or(default),
        Limit::Value(cap) => match requested {
            Some(r) if r < cap => r,
            _ => cap,
        },
    }
}
