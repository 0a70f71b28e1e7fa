//! Cross-site transport seam and its NiFi adapter.
//!
//! The adapter deploys a templated "transfer results" flow inside the set's
//! process group, points it at the remote input port, pushes exactly one
//! file through, and tears the ephemeral flow down again.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport http: {0}")]
    Http(String),
    #[error("transport flow: {0}")]
    Flow(String),
    #[error("transport timed out")]
    Timeout,
}

/// Two-operation view of the cross-site transport: ship one file, and tear
/// down whatever ephemeral control-plane state was left behind.
#[async_trait]
pub trait CrossSiteTransport: Send + Sync {
    async fn send_file(
        &self,
        target_uri: &str,
        target_port: &str,
        file: &Path,
    ) -> Result<(), TransportError>;

    async fn cleanup(&self);
}

/// Remnants of one deployed flow, kept so cleanup can delete them if the
/// send aborted half-way.
#[derive(Debug, Clone)]
struct DeployedFlow {
    processor_id: String,
    remote_group_id: String,
}

pub struct NifiTransport {
    api: String,
    group: String,
    template: String,
    http: reqwest::Client,
    deployed: Mutex<Vec<DeployedFlow>>,
}

const TRANSFER_TEMPLATE: &str = "tr_res_temp";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

impl NifiTransport {
    /// `host` is the NiFi API base (e.g. `https://nifi.site:8443/nifi-api`);
    /// `group` is the process group named after the set. The flow registry,
    /// when present, only matters for template provisioning, which happens
    /// out of band.
    pub fn new(host: &str, registry: Option<&str>, group: &str) -> Self {
        if let Some(registry) = registry {
            debug!(registry, "flow registry configured for transport");
        }
        Self {
            api: host.trim_end_matches('/').to_string(),
            group: group.to_string(),
            template: TRANSFER_TEMPLATE.to_string(),
            http: reqwest::Client::new(),
            deployed: Mutex::new(Vec::new()),
        }
    }

    async fn get(&self, path: &str) -> Result<Value, TransportError> {
        let url = format!("{}{path}", self.api);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Http(format!("GET {url}: {}", resp.status())));
        }
        resp.json()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))
    }

    async fn put(&self, path: &str, body: Value) -> Result<Value, TransportError> {
        let url = format!("{}{path}", self.api);
        let resp = self
            .http
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Http(format!("PUT {url}: {}", resp.status())));
        }
        resp.json()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, TransportError> {
        let url = format!("{}{path}", self.api);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Http(format!(
                "POST {url}: {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))
    }

    async fn delete(&self, path: &str, version: i64) -> Result<(), TransportError> {
        let url = format!("{}{path}?version={version}&disconnectedNodeAcknowledged=true", self.api);
        let resp = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Http(format!(
                "DELETE {url}: {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn process_group_id(&self) -> Result<String, TransportError> {
        let found = self
            .get(&format!("/flow/search-results?q={}", self.group))
            .await?;
        found["searchResultsDTO"]["processGroupResults"]
            .as_array()
            .and_then(|groups| {
                groups
                    .iter()
                    .find(|g| g["name"].as_str() == Some(self.group.as_str()))
            })
            .and_then(|g| g["id"].as_str())
            .map(str::to_string)
            .ok_or_else(|| TransportError::Flow(format!("process group {:?} not found", self.group)))
    }

    async fn template_id(&self) -> Result<String, TransportError> {
        let templates = self.get("/flow/templates").await?;
        templates["templates"]
            .as_array()
            .and_then(|ts| {
                ts.iter()
                    .find(|t| t["template"]["name"].as_str() == Some(self.template.as_str()))
            })
            .and_then(|t| t["id"].as_str())
            .map(str::to_string)
            .ok_or_else(|| TransportError::Flow(format!("template {:?} not found", self.template)))
    }

    fn revision(entity: &Value) -> Value {
        entity["revision"].clone()
    }

    async fn set_run_status(
        &self,
        kind: &str,
        id: &str,
        state: &str,
    ) -> Result<(), TransportError> {
        let entity = self.get(&format!("/{kind}/{id}")).await?;
        self.put(
            &format!("/{kind}/{id}/run-status"),
            json!({
                "revision": Self::revision(&entity),
                "state": state,
                "disconnectedNodeAcknowledged": true,
            }),
        )
        .await?;
        Ok(())
    }

    /// Wait until the remote group has seen the target uri and exposes the
    /// requested input port, returning the port id.
    async fn remote_port_id(
        &self,
        rpg_id: &str,
        target_port: &str,
    ) -> Result<String, TransportError> {
        loop {
            let rpg = self.get(&format!("/remote-process-groups/{rpg_id}")).await?;
            let port = rpg["component"]["contents"]["inputPorts"]
                .as_array()
                .and_then(|ports| {
                    ports
                        .iter()
                        .find(|p| p["name"].as_str() == Some(target_port))
                })
                .and_then(|p| p["id"].as_str())
                .map(str::to_string);
            if let Some(id) = port {
                return Ok(id);
            }
            debug!(port = target_port, "remote input port not visible yet");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn flow_files_sent(&self, rpg_id: &str) -> Result<i64, TransportError> {
        let rpg = self.get(&format!("/remote-process-groups/{rpg_id}")).await?;
        Ok(rpg["status"]["aggregateSnapshot"]["flowFilesSent"]
            .as_i64()
            .unwrap_or(0))
    }

    async fn teardown(&self, flow: &DeployedFlow) -> Result<(), TransportError> {
        self.set_run_status("remote-process-groups", &flow.remote_group_id, "STOPPED")
            .await?;
        self.set_run_status("processors", &flow.processor_id, "STOPPED")
            .await?;
        let proc = self.get(&format!("/processors/{}", flow.processor_id)).await?;
        let version = proc["revision"]["version"].as_i64().unwrap_or(0);
        self.delete(&format!("/processors/{}", flow.processor_id), version)
            .await?;
        let rpg = self
            .get(&format!("/remote-process-groups/{}", flow.remote_group_id))
            .await?;
        let version = rpg["revision"]["version"].as_i64().unwrap_or(0);
        self.delete(
            &format!("/remote-process-groups/{}", flow.remote_group_id),
            version,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CrossSiteTransport for NifiTransport {
    async fn send_file(
        &self,
        target_uri: &str,
        target_port: &str,
        file: &Path,
    ) -> Result<(), TransportError> {
        let dir = file
            .parent()
            .ok_or_else(|| TransportError::Flow("artifact has no parent directory".into()))?;
        let file_name = file
            .file_name()
            .ok_or_else(|| TransportError::Flow("artifact has no file name".into()))?
            .to_string_lossy()
            .to_string();

        let pg_id = self.process_group_id().await?;
        let template_id = self.template_id().await?;

        // Deploy the transfer template and pick out its three parts: the
        // source processor, the remote group, and the connection between them.
        let instance = self
            .post(
                &format!("/process-groups/{pg_id}/template-instance"),
                json!({"templateId": template_id, "originX": 0.0, "originY": 0.0}),
            )
            .await?;
        let flow = &instance["flow"];
        let processor_id = flow["processors"][0]["id"]
            .as_str()
            .ok_or_else(|| TransportError::Flow("template has no source processor".into()))?
            .to_string();
        let rpg_id = flow["remoteProcessGroups"][0]["id"]
            .as_str()
            .ok_or_else(|| TransportError::Flow("template has no remote group".into()))?
            .to_string();
        let connection_id = flow["connections"][0]["id"]
            .as_str()
            .ok_or_else(|| TransportError::Flow("template has no connection".into()))?
            .to_string();
        self.deployed.lock().unwrap().push(DeployedFlow {
            processor_id: processor_id.clone(),
            remote_group_id: rpg_id.clone(),
        });

        // Point the remote group at the destination node.
        let rpg = self.get(&format!("/remote-process-groups/{rpg_id}")).await?;
        self.put(
            &format!("/remote-process-groups/{rpg_id}"),
            json!({
                "revision": Self::revision(&rpg),
                "component": {"id": rpg_id, "targetUris": target_uri},
            }),
        )
        .await?;
        let port_id = self.remote_port_id(&rpg_id, target_port).await?;

        // Re-target the connection at the declared remote input port.
        let conn = self.get(&format!("/connections/{connection_id}")).await?;
        self.put(
            &format!("/connections/{connection_id}"),
            json!({
                "revision": Self::revision(&conn),
                "component": {
                    "id": connection_id,
                    "destination": {
                        "id": port_id,
                        "groupId": rpg_id,
                        "type": "REMOTE_INPUT_PORT",
                    },
                },
            }),
        )
        .await?;

        // Point the source processor at the packaged artifact.
        let proc = self.get(&format!("/processors/{processor_id}")).await?;
        self.put(
            &format!("/processors/{processor_id}"),
            json!({
                "revision": Self::revision(&proc),
                "component": {
                    "id": processor_id,
                    "config": {"properties": {
                        "Input Directory": dir.to_string_lossy(),
                        "File Filter": file_name,
                    }},
                },
            }),
        )
        .await?;

        self.set_run_status("processors", &processor_id, "RUNNING")
            .await?;
        self.set_run_status("remote-process-groups", &rpg_id, "TRANSMITTING")
            .await?;

        while self.flow_files_sent(&rpg_id).await? == 0 {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        info!(file = %file.display(), target = target_uri, "artifact shipped cross-site");

        let flow = DeployedFlow {
            processor_id,
            remote_group_id: rpg_id,
        };
        self.teardown(&flow).await?;
        self.deployed
            .lock()
            .unwrap()
            .retain(|f| f.processor_id != flow.processor_id);
        Ok(())
    }

    async fn cleanup(&self) {
        let remnants: Vec<DeployedFlow> = self.deployed.lock().unwrap().drain(..).collect();
        for flow in remnants {
            if let Err(e) = self.teardown(&flow).await {
                warn!(processor = %flow.processor_id, error = %e, "failed to tear down ephemeral flow");
            }
        }
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<String>>,
}

#[cfg(test)]
impl FakeTransport {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl CrossSiteTransport for FakeTransport {
    async fn send_file(
        &self,
        _target_uri: &str,
        _target_port: &str,
        file: &Path,
    ) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push(file.to_string_lossy().to_string());
        Ok(())
    }

    async fn cleanup(&self) {}
}
