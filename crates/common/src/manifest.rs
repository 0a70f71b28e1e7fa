use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// File written by a running container at the request root to ask the engine
/// to stop iterating the current service.
pub const STOP_MARKER: &str = "stop.iterating";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest not found at {0}")]
    NotFound(PathBuf),
    #[error("manifest io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed manifest: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

/// Iteration budget of a service. The wire form is either an integer or the
/// literal string `inf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxRep {
    Inf,
    Count(u32),
}

impl Serialize for MaxRep {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MaxRep::Inf => serializer.serialize_str("inf"),
            MaxRep::Count(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for MaxRep {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MaxRepVisitor;

        impl<'de> Visitor<'de> for MaxRepVisitor {
            type Value = MaxRep;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or the string \"inf\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<MaxRep, E> {
                u32::try_from(v)
                    .map(MaxRep::Count)
                    .map_err(|_| E::custom("iteration count out of range"))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<MaxRep, E> {
                u32::try_from(v)
                    .map(MaxRep::Count)
                    .map_err(|_| E::custom("iteration count out of range"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<MaxRep, E> {
                if v.eq_ignore_ascii_case("inf") {
                    Ok(MaxRep::Inf)
                } else {
                    v.parse::<u32>()
                        .map(MaxRep::Count)
                        .map_err(|_| E::custom(format!("unrecognized iteration bound {v:?}")))
                }
            }
        }

        deserializer.deserialize_any(MaxRepVisitor)
    }
}

/// Value of the `curserv` manifest field: either one of the two lifecycle
/// sentinels or the name of the service currently being processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CurrentService {
    PreServices,
    Service(String),
    PostServices,
}

impl Default for CurrentService {
    fn default() -> Self {
        CurrentService::PreServices
    }
}

impl From<String> for CurrentService {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pre_services" => CurrentService::PreServices,
            "post_services" => CurrentService::PostServices,
            _ => CurrentService::Service(s),
        }
    }
}

impl From<CurrentService> for String {
    fn from(c: CurrentService) -> String {
        match c {
            CurrentService::PreServices => "pre_services".to_string(),
            CurrentService::PostServices => "post_services".to_string(),
            CurrentService::Service(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepKind {
    #[serde(rename = "f")]
    File,
    #[serde(rename = "d")]
    Dir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountMode {
    #[serde(rename = "rw")]
    Rw,
    #[serde(rename = "ro")]
    Ro,
}

impl MountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountMode::Rw => "rw",
            MountMode::Ro => "ro",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultAction {
    Copy,
    Move,
}

/// One step of the ordered action list attached to a result pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultStep {
    pub action: ResultAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMount {
    pub container_data_path: String,
    pub mode: MountMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dependencies {
    #[serde(default)]
    pub files: IndexMap<String, DepKind>,
    #[serde(default)]
    pub ser: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iterative {
    pub max_rep: MaxRep,
    #[serde(default)]
    pub cur_iter: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRule {
    pub condition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Sink {
    pub transfer: TransferRule,
    pub bucket: String,
    pub path: String,
    #[serde(default)]
    pub results: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NifiSink {
    pub transfer: TransferRule,
    pub target_uri: String,
    pub target_remote_input_port: String,
    pub archname: String,
    #[serde(default)]
    pub results: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpSink {
    pub transfer: TransferRule,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub dest_path: String,
    #[serde(default)]
    pub results: Vec<String>,
}

/// Sinks for the finished request. Each block follows the per-service sink
/// shape; `transfer` is the master switch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalDestination {
    #[serde(default)]
    pub transfer: bool,
    #[serde(default)]
    pub s3: Option<S3Sink>,
    #[serde(default)]
    pub nifi: Option<NifiSink>,
    #[serde(default)]
    pub sftp: Option<SftpSink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub image: String,
    #[serde(default)]
    pub tasks: Option<u64>,
    #[serde(default)]
    pub ser_check_thr: Option<u64>,
    #[serde(default)]
    pub container_dir: Option<String>,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub data: IndexMap<String, DataMount>,
    #[serde(default)]
    pub mnts: Vec<String>,
    #[serde(default)]
    pub envs: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub cmd_eng: String,
    pub script: String,
    #[serde(default)]
    pub dependencies: Dependencies,
    #[serde(default)]
    pub iterative: Option<Iterative>,
    #[serde(default)]
    pub results: IndexMap<String, Vec<ResultStep>>,
    #[serde(default)]
    pub toremove: Vec<String>,
    #[serde(default)]
    pub s3: Option<S3Sink>,
    #[serde(default)]
    pub nifi: Vec<NifiSink>,
    #[serde(default)]
    pub sftp: Vec<SftpSink>,
}

impl Service {
    pub fn cur_iter(&self) -> u32 {
        self.iterative.as_ref().map(|i| i.cur_iter).unwrap_or(0)
    }

    /// A service is done when its iteration budget is exhausted, or when the
    /// request-level stop marker is present. A service without an `iterative`
    /// block never iterates and is vacuously done.
    pub fn is_done(&self, req_dir: &Path) -> bool {
        if req_dir.join(STOP_MARKER).is_file() {
            return true;
        }
        match &self.iterative {
            None => true,
            Some(it) => match it.max_rep {
                MaxRep::Inf => false,
                MaxRep::Count(n) => it.cur_iter >= n,
            },
        }
    }
}

/// The durable request manifest. It is the single source of truth for
/// progress; every mutation goes back to disk through [`store_manifest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub fin_dest: Option<FinalDestination>,
    #[serde(default)]
    pub curserv: CurrentService,
    pub services: IndexMap<String, Service>,
}

impl Manifest {
    pub fn all_services_done(&self, req_dir: &Path) -> bool {
        self.services.values().all(|s| s.is_done(req_dir))
    }
}

pub fn load_manifest(path: &Path) -> Result<Manifest, ManifestError> {
    if !path.is_file() {
        return Err(ManifestError::NotFound(path.to_path_buf()));
    }
    let text = fs::read_to_string(path)?;
    Ok(serde_yaml_ng::from_str(&text)?)
}

/// Write the manifest through a same-directory temp file and rename it into
/// place. The rename is what makes a crash leave either the old or the new
/// manifest, never a torn one.
pub fn store_manifest(path: &Path, manifest: &Manifest) -> Result<(), ManifestError> {
    let text = serde_yaml_ng::to_string(manifest)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "manifest".to_string());
    let tmp = dir.join(format!(".{file_name}.tmp"));
    fs::write(&tmp, text.as_bytes())?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Raise the iteration budget of every service by one. Called when a finished
/// request returns to the node so it runs once more; an infinite budget is
/// left as is.
pub fn increment_all_max_rep(path: &Path) -> Result<(), ManifestError> {
    let mut manifest = load_manifest(path)?;
    for service in manifest.services.values_mut() {
        if let Some(it) = service.iterative.as_mut() {
            if let MaxRep::Count(n) = it.max_rep {
                it.max_rep = MaxRep::Count(n + 1);
            }
        }
    }
    store_manifest(path, &manifest)
}

/// Decide whether a service should run another iteration.
pub fn should_iterate(iter_conf: Option<&Iterative>, cur_iter: u32, stop_marker: &Path) -> bool {
    if stop_marker.is_file() {
        return false;
    }
    match iter_conf {
        None => false,
        Some(it) => match it.max_rep {
            MaxRep::Inf => true,
            MaxRep::Count(n) => cur_iter < n,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
fin_dest:
  transfer: false
curserv: pre_services
services:
  train:
    image: python:3.10
    tasks: 2
    ser_check_thr: 120
    cmd_eng: python
    script: train.py
    dependencies:
      files:
        input.csv: f
      ser: []
    iterative:
      max_rep: 3
      cur_iter: 1
    results:
      out.csv:
        - action: move
    toremove:
      - scratch
  report:
    image: python:3.10
    cmd_eng: python
    script: report.py
    dependencies:
      ser: [train]
    iterative:
      max_rep: inf
      cur_iter: 0
"#;

    #[test]
    fn parses_typed_manifest() {
        let m: Manifest = serde_yaml_ng::from_str(SAMPLE).unwrap();
        assert_eq!(m.curserv, CurrentService::PreServices);
        let train = &m.services["train"];
        assert_eq!(train.iterative.as_ref().unwrap().max_rep, MaxRep::Count(3));
        assert_eq!(train.cur_iter(), 1);
        assert_eq!(train.dependencies.files["input.csv"], DepKind::File);
        assert_eq!(train.results["out.csv"][0].action, ResultAction::Move);
        let report = &m.services["report"];
        assert_eq!(report.iterative.as_ref().unwrap().max_rep, MaxRep::Inf);
        assert_eq!(report.dependencies.ser, vec!["train".to_string()]);
    }

    #[test]
    fn curserv_sentinels_round_trip() {
        for (text, want) in [
            ("pre_services", CurrentService::PreServices),
            ("post_services", CurrentService::PostServices),
            ("train", CurrentService::Service("train".into())),
        ] {
            let parsed: CurrentService = serde_yaml_ng::from_str(text).unwrap();
            assert_eq!(parsed, want);
            let back = serde_yaml_ng::to_string(&parsed).unwrap();
            assert_eq!(back.trim(), text);
        }
    }

    #[test]
    fn store_is_atomic_and_readable_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.yml");
        let mut m: Manifest = serde_yaml_ng::from_str(SAMPLE).unwrap();
        store_manifest(&path, &m).unwrap();

        m.services["train"].iterative.as_mut().unwrap().cur_iter = 2;
        m.curserv = CurrentService::Service("train".into());
        store_manifest(&path, &m).unwrap();

        // No temp file is left behind and the read returns the post-update state.
        assert!(!dir.path().join(".conf.yml.tmp").exists());
        let back = load_manifest(&path).unwrap();
        assert_eq!(back.services["train"].cur_iter(), 2);
        assert_eq!(back.curserv, CurrentService::Service("train".into()));
    }

    #[test]
    fn max_rep_increment_skips_infinite_budgets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.yml");
        let m: Manifest = serde_yaml_ng::from_str(SAMPLE).unwrap();
        store_manifest(&path, &m).unwrap();

        increment_all_max_rep(&path).unwrap();
        let back = load_manifest(&path).unwrap();
        assert_eq!(
            back.services["train"].iterative.as_ref().unwrap().max_rep,
            MaxRep::Count(4)
        );
        assert_eq!(
            back.services["report"].iterative.as_ref().unwrap().max_rep,
            MaxRep::Inf
        );
    }

    #[test]
    fn iteration_decision_rules() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join(STOP_MARKER);
        let bounded = Iterative {
            max_rep: MaxRep::Count(2),
            cur_iter: 0,
        };
        let endless = Iterative {
            max_rep: MaxRep::Inf,
            cur_iter: 7,
        };

        assert!(should_iterate(Some(&bounded), 0, &marker));
        assert!(should_iterate(Some(&bounded), 1, &marker));
        assert!(!should_iterate(Some(&bounded), 2, &marker));
        assert!(should_iterate(Some(&endless), 1000, &marker));
        assert!(!should_iterate(None, 0, &marker));

        std::fs::write(&marker, b"done").unwrap();
        assert!(!should_iterate(Some(&endless), 0, &marker));
        assert!(!should_iterate(Some(&bounded), 0, &marker));
    }

    #[test]
    fn done_follows_budget_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let m: Manifest = serde_yaml_ng::from_str(SAMPLE).unwrap();
        assert!(!m.services["train"].is_done(dir.path()));
        assert!(!m.services["report"].is_done(dir.path()));

        std::fs::write(dir.path().join(STOP_MARKER), b"").unwrap();
        assert!(m.services["report"].is_done(dir.path()));
        assert!(m.all_services_done(dir.path()));
    }
}
