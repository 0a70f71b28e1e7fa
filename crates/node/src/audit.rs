use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::config::{SetConfig, SiteConfig};

pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Per-sink delivery record in the structured request log.
#[derive(Debug, Clone, Serialize)]
pub struct SinkRecord {
    pub sent: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub res_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceRecord {
    pub tasks: u64,
    pub start: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub s3: Vec<SinkRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nifi: Vec<SinkRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sftp: Vec<SinkRecord>,
}

/// One structured record per request, written as YAML when the request is
/// finalized.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub node: String,
    pub request: String,
    pub start: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub services: IndexMap<String, ServiceRecord>,
}

impl RequestLog {
    pub fn new(node: &str, request: &str) -> Self {
        Self {
            node: node.to_string(),
            request: request.to_string(),
            start: unix_now(),
            end: None,
            status: None,
            services: IndexMap::new(),
        }
    }

    pub fn service_started(&mut self, instance: &str, tasks: u64) {
        self.services.insert(
            instance.to_string(),
            ServiceRecord {
                tasks,
                start: unix_now(),
                end: None,
                status: None,
                s3: Vec::new(),
                nifi: Vec::new(),
                sftp: Vec::new(),
            },
        );
    }

    pub fn service_finished(&mut self, instance: &str, status: &str) {
        if let Some(rec) = self.services.get_mut(instance) {
            rec.end = Some(unix_now());
            rec.status = Some(status.to_string());
        }
    }

    pub fn sink_sent(&mut self, instance: &str, sink: &str, record: SinkRecord) {
        if let Some(rec) = self.services.get_mut(instance) {
            match sink {
                "s3" => rec.s3.push(record),
                "nifi" => rec.nifi.push(record),
                "sftp" => rec.sftp.push(record),
                _ => {}
            }
        }
    }

    pub fn finish(&mut self, status: &str) {
        self.end = Some(unix_now());
        self.status = Some(status.to_string());
    }
}

/// Per-set audit sink: the append-only `out.log`, the structured request
/// logs, and the optional middleware POST.
pub struct Audit {
    out_log: PathBuf,
    req_log_dir: PathBuf,
    middleware: Option<crate::config::MiddlewareLog>,
    http: reqwest::Client,
    pub node: String,
}

impl Audit {
    pub fn new(site: &SiteConfig, set: &SetConfig) -> Self {
        let node = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            out_log: site.log_dir(set).join("out.log"),
            req_log_dir: site.req_log_path.clone(),
            middleware: site.middleware.as_ref().map(|m| m.log.clone()),
            http: reqwest::Client::new(),
            node,
        }
    }

    /// Append one `<unix-time>:<event text>` line to the set's log.
    pub fn line(&self, text: &str) {
        let entry = format!("{}:{}\n", unix_now(), text);
        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.out_log)
            .and_then(|mut f| f.write_all(entry.as_bytes()));
        if let Err(e) = appended {
            warn!(path = %self.out_log.display(), error = %e, "failed to append audit line");
        }
    }

    /// POST one structured record to the middleware log, if configured.
    /// Failures never block progress.
    pub async fn middleware(&self, body: serde_json::Value) {
        let Some(conf) = &self.middleware else {
            return;
        };
        if !conf.condition {
            return;
        }
        let mut req = self.http.post(&conf.url).json(&body);
        for (k, v) in &conf.header {
            req = req.header(k.as_str(), v.as_str());
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!(status = %resp.status(), "middleware log rejected the record");
            }
            Err(e) => {
                warn!(error = %e, "middleware log unreachable");
            }
        }
    }

    /// Write the structured request log as `<request>.<uuid>.log.yml` under
    /// the audit directory.
    pub fn write_request_log(&self, log: &RequestLog) -> Result<PathBuf> {
        fs::create_dir_all(&self.req_log_dir)?;
        let file = self
            .req_log_dir
            .join(format!("{}.{}.log.yml", log.request, Uuid::new_v4()));
        let text = serde_yaml_ng::to_string(log)?;
        fs::write(&file, text).with_context(|| format!("writing {}", file.display()))?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::load_sample;

    #[test]
    fn audit_lines_carry_a_unix_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let site = load_sample(dir.path());
        let set = site.set("hydro").unwrap();
        let audit = Audit::new(&site, set);

        audit.line("request flood started");
        audit.line("service sim launched");

        let text = fs::read_to_string(site.log_dir(set).join("out.log")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let (ts, rest) = line.split_once(':').unwrap();
            assert!(ts.parse::<i64>().is_ok());
            assert!(!rest.is_empty());
        }
        assert!(text.contains("service sim launched"));
    }

    #[test]
    fn request_log_round_trips_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let site = load_sample(dir.path());
        let set = site.set("hydro").unwrap();
        let audit = Audit::new(&site, set);

        let mut log = RequestLog::new(&audit.node, "flood");
        log.service_started("sim", 2);
        log.sink_sent(
            "sim",
            "nifi",
            SinkRecord {
                sent: unix_now(),
                res_file: Some("res.42.zip".to_string()),
                destination: Some("https://downstream/nifi".to_string()),
                sha256: Some("ab".repeat(32)),
            },
        );
        log.service_finished("sim", "succeed");
        log.finish("success");

        let path = audit.write_request_log(&log).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("flood."));
        assert!(name.ends_with(".log.yml"));

        let parsed: serde_yaml_ng::Value =
            serde_yaml_ng::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["request"].as_str(), Some("flood"));
        assert_eq!(parsed["status"].as_str(), Some("success"));
        assert_eq!(parsed["services"]["sim"]["tasks"].as_u64(), Some(2));
        assert_eq!(
            parsed["services"]["sim"]["nifi"][0]["res_file"].as_str(),
            Some("res.42.zip")
        );
    }
}
