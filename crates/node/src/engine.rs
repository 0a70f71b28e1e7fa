use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

pub mod docker;
#[cfg(test)]
pub mod fake;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a service named {0:?} already exists")]
    NameConflict(String),
    #[error("engine refused to create service {name}: {reason}")]
    Create { name: String, reason: String },
    #[error("engine lookup failed: {0}")]
    Lookup(String),
    #[error("engine delete failed: {0}")]
    Delete(String),
}

/// State of one replica task of a service. `Complete` is the terminal
/// success signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Complete,
    Failed,
    Other,
}

/// Everything the engine needs to create one replicated container service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub replicas: u64,
    /// `source:target[:mode]` bind mounts.
    pub mounts: Vec<String>,
    pub work_dir: Option<String>,
    pub env: Vec<String>,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub user: Option<String>,
    pub groups: Vec<String>,
}

/// Narrow view of the container cluster. The scheduler only ever creates,
/// inspects, and deletes replicated services and reads their task states.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn create_service(&self, spec: ServiceSpec) -> Result<(), EngineError>;

    /// Whether a service by this name exists in the engine.
    async fn service_exists(&self, name: &str) -> Result<bool, EngineError>;

    async fn list_services(&self) -> Result<Vec<String>, EngineError>;

    async fn delete_service(&self, name: &str) -> Result<(), EngineError>;

    /// Current state of every replica task of the named service.
    async fn task_states(&self, name: &str) -> Result<Vec<TaskState>, EngineError>;
}

/// Poll the engine once per second until all `replicas` tasks of `name`
/// report `Complete`, or the TTL budget runs out. Lookup errors consume
/// budget like any other second.
pub async fn await_completion(
    engine: &dyn ContainerEngine,
    name: &str,
    replicas: u64,
    ttl_secs: u64,
) -> bool {
    let mut budget = ttl_secs;
    while budget > 0 {
        match engine.task_states(name).await {
            Ok(states) => {
                let complete = states.iter().filter(|s| **s == TaskState::Complete).count();
                if complete as u64 >= replicas {
                    return true;
                }
                debug!(service = %name, complete, replicas, "waiting for service completion");
            }
            Err(e) => {
                warn!(service = %name, error = %e, "engine lookup failed while waiting");
            }
        }
        budget -= 1;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::fake::FakeEngine;
    use super::*;

    fn spec(name: &str, replicas: u64) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            image: "python:3.10".to_string(),
            replicas,
            mounts: vec![],
            work_dir: None,
            env: vec![],
            command: vec!["python".into(), "run.py".into()],
            args: vec![],
            user: None,
            groups: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_when_all_replicas_finish() {
        let engine = FakeEngine::new();
        engine.create_service(spec("sim", 2)).await.unwrap();
        assert!(await_completion(&engine, "sim", 2, 5).await);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_tasks_never_complete() {
        let engine = FakeEngine::new().never_complete();
        engine.create_service(spec("sim", 1)).await.unwrap();
        assert!(!await_completion(&engine, "sim", 1, 2).await);
    }

    #[tokio::test]
    async fn duplicate_names_are_conflicts() {
        let engine = FakeEngine::new();
        engine.create_service(spec("sim", 1)).await.unwrap();
        let err = engine.create_service(spec("sim", 1)).await.unwrap_err();
        assert!(matches!(err, EngineError::NameConflict(_)));
        assert!(engine.service_exists("sim").await.unwrap());
        assert!(!engine.service_exists("other").await.unwrap());
    }
}
