use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use common::manifest::MountMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("site file not found at {0}")]
    NotFound(PathBuf),
    #[error("site io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed site file: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
    #[error("unknown set {0:?}")]
    UnknownSet(String),
    #[error("directory {0} already exists and exist_ok is false")]
    Exists(PathBuf),
}

/// A per-set cap that is either unbounded (`any` on the wire) or a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Any,
    Value(u64),
}

impl Serialize for Limit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Limit::Any => serializer.serialize_str("any"),
            Limit::Value(n) => serializer.serialize_u64(*n),
        }
    }
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LimitVisitor;

        impl<'de> Visitor<'de> for LimitVisitor {
            type Value = Limit;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or the string \"any\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Limit, E> {
                Ok(Limit::Value(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Limit, E> {
                u64::try_from(v)
                    .map(Limit::Value)
                    .map_err(|_| E::custom("limit out of range"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Limit, E> {
                if v.eq_ignore_ascii_case("any") {
                    Ok(Limit::Any)
                } else {
                    v.parse::<u64>()
                        .map(Limit::Value)
                        .map_err(|_| E::custom(format!("unrecognized limit {v:?}")))
                }
            }
        }

        deserializer.deserialize_any(LimitVisitor)
    }
}

/// Whether completed container services are removed from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TerminatePolicy {
    Retain,
    Remove,
}

impl From<String> for TerminatePolicy {
    fn from(s: String) -> Self {
        if s.eq_ignore_ascii_case("inf") {
            TerminatePolicy::Retain
        } else {
            TerminatePolicy::Remove
        }
    }
}

impl From<TerminatePolicy> for String {
    fn from(p: TerminatePolicy) -> String {
        match p {
            TerminatePolicy::Retain => "inf".to_string(),
            TerminatePolicy::Remove => "now".to_string(),
        }
    }
}

/// One entry of the spool directory tree: `{name, mode, exist_ok}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    #[serde(default)]
    pub mode: Option<u32>,
    #[serde(default)]
    pub exist_ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDir {
    pub path: PathBuf,
    #[serde(default)]
    pub modes: Vec<MountMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerPolicy {
    /// Allow-listed image references; the key `any` admits every image.
    pub docker_img: IndexMap<String, serde_yaml_ng::Value>,
    pub docker_rep: Limit,
    pub ttl: Limit,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub groups: Option<Vec<String>>,
}

impl DockerPolicy {
    pub fn allows_image(&self, image: &str) -> bool {
        self.docker_img
            .keys()
            .any(|k| k.eq_ignore_ascii_case("any") || k == image)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NifiEndpoint {
    pub host: String,
    #[serde(default)]
    pub registry: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetConfig {
    pub name: String,
    #[serde(default)]
    pub exist_ok: bool,
    pub terminate: TerminatePolicy,
    #[serde(default)]
    pub set_function: Option<String>,
    #[serde(default)]
    pub data_dir: IndexMap<String, DataDir>,
    pub docker: DockerPolicy,
    #[serde(default)]
    pub nifi: Option<NifiEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domains {
    pub root_script_path: TreeEntry,
    pub script_path_in: TreeEntry,
    pub script_path_out: TreeEntry,
    pub script_path_failed: TreeEntry,
    pub log_path: TreeEntry,
    pub req_res_path_per_request: TreeEntry,
    pub unpack_int: u64,
    pub proc_int: u64,
    pub sets: IndexMap<String, SetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConf {
    pub conf_file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareLog {
    pub condition: bool,
    pub url: String,
    #[serde(default)]
    pub header: IndexMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Middleware {
    pub log: MiddlewareLog,
}

/// Site policy and layout for this node, loaded once at startup and
/// read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub domains: Domains,
    pub user_conf: UserConf,
    pub req_log_path: PathBuf,
    #[serde(default)]
    pub middleware: Option<Middleware>,
}

impl SiteConfig {
    pub fn load(path: &Path) -> Result<SiteConfig, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        let site: SiteConfig = serde_yaml_ng::from_str(&text)?;
        Ok(site)
    }

    pub fn set(&self, key: &str) -> Result<&SetConfig, ConfigError> {
        self.domains
            .sets
            .get(key)
            .ok_or_else(|| ConfigError::UnknownSet(key.to_string()))
    }

    fn set_root(&self, set: &SetConfig) -> PathBuf {
        Path::new(&self.domains.root_script_path.name).join(&set.name)
    }

    pub fn in_dir(&self, set: &SetConfig) -> PathBuf {
        self.set_root(set).join(&self.domains.script_path_in.name)
    }

    pub fn finished_dir(&self, set: &SetConfig) -> PathBuf {
        self.set_root(set).join(&self.domains.script_path_out.name)
    }

    pub fn failed_dir(&self, set: &SetConfig) -> PathBuf {
        self.set_root(set).join(&self.domains.script_path_failed.name)
    }

    pub fn log_dir(&self, set: &SetConfig) -> PathBuf {
        self.set_root(set).join(&self.domains.log_path.name)
    }

    /// Name of the per-request results sub-directory.
    pub fn results_name(&self) -> &str {
        &self.domains.req_res_path_per_request.name
    }

    pub fn manifest_name(&self) -> &str {
        &self.user_conf.conf_file_name
    }

    /// Create the full spool tree for every set, honoring `exist_ok` and the
    /// configured mode bits.
    pub fn ensure_layout(&self) -> Result<(), ConfigError> {
        let d = &self.domains;
        make_dir(
            Path::new(&d.root_script_path.name),
            d.root_script_path.exist_ok,
            d.root_script_path.mode,
        )?;
        for set in d.sets.values() {
            make_dir(&self.set_root(set), set.exist_ok, None)?;
            make_dir(&self.in_dir(set), d.script_path_in.exist_ok, d.script_path_in.mode)?;
            make_dir(
                &self.finished_dir(set),
                d.script_path_out.exist_ok,
                d.script_path_out.mode,
            )?;
            make_dir(
                &self.failed_dir(set),
                d.script_path_failed.exist_ok,
                d.script_path_failed.mode,
            )?;
            make_dir(&self.log_dir(set), d.log_path.exist_ok, d.log_path.mode)?;
        }
        make_dir(&self.req_log_path, true, None)?;
        Ok(())
    }
}

fn make_dir(path: &Path, exist_ok: bool, mode: Option<u32>) -> Result<(), ConfigError> {
    if path.exists() {
        if exist_ok {
            return Ok(());
        }
        return Err(ConfigError::Exists(path.to_path_buf()));
    }
    fs::create_dir_all(path)?;
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A complete site file rooted at `root`, with one set named `hydro`.
    pub(crate) fn sample_site(root: &Path) -> String {
        format!(
            r#"
domains:
  root_script_path:
    name: {root}/spool
    mode: 493
    exist_ok: true
  script_path_in:
    name: in
    exist_ok: true
  script_path_out:
    name: finished
    exist_ok: true
  script_path_failed:
    name: failed
    exist_ok: true
  log_path:
    name: log
    exist_ok: true
  req_res_path_per_request:
    name: results
    exist_ok: true
  unpack_int: 1
  proc_int: 1
  sets:
    hydro:
      name: hydro
      exist_ok: true
      terminate: inf
      data_dir:
        observations:
          path: {root}/data/observations
          modes: [ro, rw]
      docker:
        docker_img:
          python:3.10: allowed
        docker_rep: 4
        ttl: 600
user_conf:
  conf_file_name: conf.yml
req_log_path: {root}/reqlog
"#,
            root = root.display()
        )
    }

    pub(crate) fn load_sample(root: &Path) -> SiteConfig {
        let text = sample_site(root);
        let site: SiteConfig = serde_yaml_ng::from_str(&text).unwrap();
        site.ensure_layout().unwrap();
        site
    }

    #[test]
    fn parses_and_builds_layout() {
        let dir = tempfile::tempdir().unwrap();
        let site = load_sample(dir.path());
        let set = site.set("hydro").unwrap();
        assert!(site.in_dir(set).is_dir());
        assert!(site.finished_dir(set).is_dir());
        assert!(site.failed_dir(set).is_dir());
        assert!(site.log_dir(set).is_dir());
        assert!(site.req_log_path.is_dir());
        assert_eq!(site.results_name(), "results");
        assert_eq!(site.manifest_name(), "conf.yml");
        assert_eq!(set.docker.docker_rep, Limit::Value(4));
        assert_eq!(set.terminate, TerminatePolicy::Retain);
        assert!(set.docker.allows_image("python:3.10"));
        assert!(!set.docker.allows_image("scratch"));
    }

    #[test]
    fn any_sentinel_stays_inside_the_loader() {
        let yaml = "any";
        let parsed: Limit = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(parsed, Limit::Any);
        let num: Limit = serde_yaml_ng::from_str("12").unwrap();
        assert_eq!(num, Limit::Value(12));
        assert!(serde_yaml_ng::from_str::<Limit>("sometimes").is_err());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = SiteConfig::load(Path::new("/definitely/not/here.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn unknown_set_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let site = load_sample(dir.path());
        assert!(matches!(
            site.set("volcano"),
            Err(ConfigError::UnknownSet(_))
        ));
    }
}
