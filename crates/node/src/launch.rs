use std::path::Path;

use common::manifest::Service;

use crate::admission::Clamped;
use crate::config::SetConfig;
use crate::engine::{ContainerEngine, EngineError, ServiceSpec};

/// Engine-facing name of one iteration of a service: the base name on the
/// first iteration, `<base>_<iter>` afterwards.
pub fn service_instance_name(base: &str, iter_no: u32) -> String {
    if iter_no == 0 {
        base.to_string()
    } else {
        format!("{base}_{iter_no}")
    }
}

fn process_user_group() -> (String, Vec<String>) {
    // Safety: getuid/getgid cannot fail.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    (uid.to_string(), vec![gid.to_string()])
}

/// Compose the full service spec for one iteration: request mount, data
/// mounts, extra mounts, env triplet, interpreter command.
pub fn compose_spec(
    set: &SetConfig,
    clamped: Clamped,
    instance_name: &str,
    service: &Service,
    request: &str,
    req_dir: &Path,
) -> ServiceSpec {
    let container_dir = service
        .container_dir
        .clone()
        .unwrap_or_else(|| format!("/{request}"));
    let mut mounts = vec![format!("{}:{}:rw", req_dir.display(), container_dir)];

    for (name, mount) in &service.data {
        if let Some(data) = set.data_dir.get(name) {
            mounts.push(format!(
                "{}:{}:{}",
                data.path.display(),
                mount.container_data_path,
                mount.mode.as_str()
            ));
        }
    }

    // Extra mounts are relative to the request directory; a leading separator
    // is stripped before joining.
    for entry in &service.mnts {
        let rel = entry.strip_prefix('/').unwrap_or(entry);
        mounts.push(format!("{}/{rel}", req_dir.display()));
    }

    let mut env = vec![
        "MY_TASK_ID={{.Task.Name}}".to_string(),
        format!("SCRIPTFILE={}", service.script),
        format!("ttl={}", clamped.ttl),
    ];
    env.extend(service.envs.iter().cloned());

    let (default_user, default_groups) = process_user_group();
    ServiceSpec {
        name: instance_name.to_string(),
        image: service.image.clone(),
        replicas: clamped.tasks,
        mounts,
        work_dir: service.work_dir.clone(),
        env,
        command: vec![service.cmd_eng.clone(), service.script.clone()],
        args: service.args.clone(),
        user: Some(set.docker.user.clone().unwrap_or(default_user)),
        groups: set.docker.groups.clone().unwrap_or(default_groups),
    }
}

/// Create the container service. Does not block on completion.
pub async fn launch_service(
    engine: &dyn ContainerEngine,
    set: &SetConfig,
    clamped: Clamped,
    instance_name: &str,
    service: &Service,
    request: &str,
    req_dir: &Path,
) -> Result<(), EngineError> {
    let spec = compose_spec(set, clamped, instance_name, service, request, req_dir);
    engine.create_service(spec).await
}
