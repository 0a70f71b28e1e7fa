//! In-memory engine used by scheduler and waiter tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ContainerEngine, EngineError, ServiceSpec, TaskState};

type CreateHook = Box<dyn Fn(&ServiceSpec) + Send + Sync>;

pub struct FakeEngine {
    services: Mutex<HashMap<String, ServiceSpec>>,
    complete: bool,
    on_create: Option<CreateHook>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            complete: true,
            on_create: None,
        }
    }

    /// Replicas stay `Running` forever; the waiter has to time out.
    pub fn never_complete(mut self) -> Self {
        self.complete = false;
        self
    }

    /// Run a hook when a service is created, standing in for the side effects
    /// of the container workload (writing result files, stop markers).
    pub fn on_create(mut self, hook: impl Fn(&ServiceSpec) + Send + Sync + 'static) -> Self {
        self.on_create = Some(Box::new(hook));
        self
    }

    pub fn created(&self, name: &str) -> bool {
        self.services.lock().unwrap().contains_key(name)
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create_service(&self, spec: ServiceSpec) -> Result<(), EngineError> {
        let mut services = self.services.lock().unwrap();
        if services.contains_key(&spec.name) {
            return Err(EngineError::NameConflict(spec.name));
        }
        if let Some(hook) = &self.on_create {
            hook(&spec);
        }
        services.insert(spec.name.clone(), spec);
        Ok(())
    }

    async fn service_exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.services.lock().unwrap().contains_key(name))
    }

    async fn list_services(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.services.lock().unwrap().keys().cloned().collect())
    }

    async fn delete_service(&self, name: &str) -> Result<(), EngineError> {
        self.services.lock().unwrap().remove(name);
        Ok(())
    }

    async fn task_states(&self, name: &str) -> Result<Vec<TaskState>, EngineError> {
        let services = self.services.lock().unwrap();
        let spec = services
            .get(name)
            .ok_or_else(|| EngineError::Lookup(format!("no such service {name}")))?;
        let state = if self.complete {
            TaskState::Complete
        } else {
            TaskState::Running
        };
        Ok(vec![state; spec.replicas as usize])
    }
}
