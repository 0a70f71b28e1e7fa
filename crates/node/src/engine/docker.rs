//! Docker swarm adapter for the [`ContainerEngine`] trait.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::models::{
    Mount, MountTypeEnum, ServiceSpec as SwarmServiceSpec, ServiceSpecMode,
    ServiceSpecModeReplicated, TaskSpec, TaskSpecContainerSpec, TaskSpecRestartPolicy,
    TaskSpecRestartPolicyConditionEnum, TaskState as SwarmTaskState,
};
use bollard::query_parameters::{ListServicesOptionsBuilder, ListTasksOptionsBuilder};
use bollard::Docker;
use tracing::info;

use super::{ContainerEngine, EngineError, ServiceSpec, TaskState};

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Lookup(e.to_string()))?;
        Ok(Self { docker })
    }
}

/// Parse a `source:target[:mode]` bind mount string.
fn parse_mount(entry: &str) -> Mount {
    // rsplitn yields segments right to left.
    let collected: Vec<&str> = entry.rsplitn(3, ':').collect();
    let (source, target, read_only) = match collected.as_slice() {
        [mode, target, source] if *mode == "ro" || *mode == "rw" => {
            (source.to_string(), target.to_string(), *mode == "ro")
        }
        [target, source] => (source.to_string(), target.to_string(), false),
        _ => (entry.to_string(), entry.to_string(), false),
    };
    Mount {
        source: Some(source),
        target: Some(target),
        typ: Some(MountTypeEnum::BIND),
        read_only: Some(read_only),
        ..Default::default()
    }
}

fn to_swarm_spec(spec: &ServiceSpec) -> SwarmServiceSpec {
    let container = TaskSpecContainerSpec {
        image: Some(spec.image.clone()),
        command: Some(spec.command.clone()),
        args: Some(spec.args.clone()),
        env: Some(spec.env.clone()),
        dir: spec.work_dir.clone(),
        user: spec.user.clone(),
        groups: if spec.groups.is_empty() {
            None
        } else {
            Some(spec.groups.clone())
        },
        mounts: Some(spec.mounts.iter().map(|m| parse_mount(m)).collect()),
        ..Default::default()
    };
    SwarmServiceSpec {
        name: Some(spec.name.clone()),
        task_template: Some(TaskSpec {
            container_spec: Some(container),
            restart_policy: Some(TaskSpecRestartPolicy {
                condition: Some(TaskSpecRestartPolicyConditionEnum::ON_FAILURE),
                ..Default::default()
            }),
            ..Default::default()
        }),
        mode: Some(ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated {
                replicas: Some(spec.replicas as i64),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create_service(&self, spec: ServiceSpec) -> Result<(), EngineError> {
        if self.service_exists(&spec.name).await? {
            return Err(EngineError::NameConflict(spec.name));
        }
        let name = spec.name.clone();
        let swarm_spec = to_swarm_spec(&spec);
        self.docker
            .create_service(swarm_spec, None)
            .await
            .map_err(|e| EngineError::Create {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        info!(service = %name, replicas = spec.replicas, "swarm service created");
        Ok(())
    }

    async fn service_exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.list_services().await?.iter().any(|s| s == name))
    }

    async fn list_services(&self) -> Result<Vec<String>, EngineError> {
        let opts = ListServicesOptionsBuilder::default().build();
        let services = self
            .docker
            .list_services(Some(opts))
            .await
            .map_err(|e| EngineError::Lookup(e.to_string()))?;
        Ok(services
            .into_iter()
            .filter_map(|s| s.spec.and_then(|spec| spec.name))
            .collect())
    }

    async fn delete_service(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .delete_service(name)
            .await
            .map_err(|e| EngineError::Delete(e.to_string()))
    }

    async fn task_states(&self, name: &str) -> Result<Vec<TaskState>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("service".to_string(), vec![name.to_string()]);
        let opts = ListTasksOptionsBuilder::default().filters(&filters).build();
        let tasks = self
            .docker
            .list_tasks(Some(opts))
            .await
            .map_err(|e| EngineError::Lookup(e.to_string()))?;
        Ok(tasks
            .into_iter()
            .map(|t| match t.status.and_then(|s| s.state) {
                Some(SwarmTaskState::COMPLETE) => TaskState::Complete,
                Some(SwarmTaskState::RUNNING) => TaskState::Running,
                Some(SwarmTaskState::FAILED) | Some(SwarmTaskState::REJECTED) => TaskState::Failed,
                Some(SwarmTaskState::PENDING) | Some(SwarmTaskState::NEW) => TaskState::Pending,
                _ => TaskState::Other,
            })
            .collect())
    }
}
