use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use common::manifest::{
    load_manifest, should_iterate, store_manifest, CurrentService, Manifest, Service, STOP_MARKER,
};
use common::reqname;

use crate::admission::{admit, AdmissionOutcome, Clamped};
use crate::audit::{unix_now, Audit, RequestLog, SinkRecord};
use crate::condition::{should_transfer, IterationState};
use crate::config::{SetConfig, SiteConfig, TerminatePolicy};
use crate::egress::nifi::CrossSiteTransport;
use crate::egress::{self, nifi::NifiTransport};
use crate::engine::{await_completion, ContainerEngine};
use crate::launch::{launch_service, service_instance_name};
use crate::results::{act_on_results, remove_stale};

/// Where a request ended up after one scheduler pass over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Finished,
    Failed,
    /// Deferred dependencies or an early stop; the request stays in `in/`.
    InProgress,
}

enum ServiceOutcome {
    Completed,
    Deferred,
    Failed(String),
    Stopped,
}

pub struct Scheduler {
    site: Arc<SiteConfig>,
    engine: Arc<dyn ContainerEngine>,
    transports: HashMap<String, Arc<dyn CrossSiteTransport>>,
}

impl Scheduler {
    pub fn new(site: Arc<SiteConfig>, engine: Arc<dyn ContainerEngine>) -> Self {
        let mut transports: HashMap<String, Arc<dyn CrossSiteTransport>> = HashMap::new();
        for (key, set) in &site.domains.sets {
            if let Some(endpoint) = &set.nifi {
                transports.insert(
                    key.clone(),
                    Arc::new(NifiTransport::new(
                        &endpoint.host,
                        endpoint.registry.as_deref(),
                        &set.name,
                    )),
                );
            }
        }
        Self {
            site,
            engine,
            transports,
        }
    }

    /// One pass over every request of the given sets. Requests within a set
    /// are processed sequentially; each request's manifest is owned by this
    /// pass alone.
    pub async fn run_once(&self, sets: &[String], stop: &AtomicBool) -> Result<()> {
        for key in sets {
            let set = self.site.set(key)?;
            if let Some(function) = &set.set_function {
                // Custom set functions are not supported; requests run under
                // the default container lifecycle.
                warn!(set = %key, function = %function, "set function ignored");
            }
            let audit = Audit::new(&self.site, set);
            let in_dir = self.site.in_dir(set);
            let entries = fs::read_dir(&in_dir)
                .with_context(|| format!("listing {}", in_dir.display()))?;
            for entry in entries {
                if stop.load(Ordering::Relaxed) {
                    return Ok(());
                }
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if !entry.path().is_dir() || reqname::is_archive(&name) {
                    continue;
                }
                match self.process_request(key, set, &name, &audit, stop).await {
                    Ok(Disposition::Finished) => {
                        info!(set = %key, request = %name, "request finished");
                    }
                    Ok(Disposition::Failed) => {
                        warn!(set = %key, request = %name, "request failed");
                    }
                    Ok(Disposition::InProgress) => {}
                    Err(e) => {
                        warn!(set = %key, request = %name, error = %e, "request processing aborted");
                    }
                }
            }
        }
        Ok(())
    }

    async fn process_request(
        &self,
        set_key: &str,
        set: &SetConfig,
        request: &str,
        audit: &Audit,
        stop: &AtomicBool,
    ) -> Result<Disposition> {
        let req_dir = self.site.in_dir(set).join(request);
        let manifest_path = req_dir.join(self.site.manifest_name());
        if !manifest_path.is_file() {
            audit.line(&format!("no manifest for request {request}"));
            return Ok(Disposition::InProgress);
        }
        let mut manifest = load_manifest(&manifest_path)?;
        let results_dir = req_dir.join(self.site.results_name());
        fs::create_dir_all(&results_dir)?;

        let mut req_log = RequestLog::new(&audit.node, request);
        audit.line(&format!("processing request {request}"));
        audit
            .middleware(json!({"request": request, "start": req_log.start}))
            .await;

        let mut failed = false;
        let mut deferred = false;
        let names: Vec<String> = manifest.services.keys().cloned().collect();
        for ser_name in names {
            if manifest.services[&ser_name].is_done(&req_dir) {
                continue;
            }
            manifest.curserv = CurrentService::Service(ser_name.clone());
            store_manifest(&manifest_path, &manifest)?;

            match self
                .run_service(
                    set_key,
                    set,
                    request,
                    &req_dir,
                    &results_dir,
                    &manifest_path,
                    &mut manifest,
                    &ser_name,
                    &mut req_log,
                    audit,
                    stop,
                )
                .await?
            {
                ServiceOutcome::Completed => {}
                // A deferred service is retried next tick; later services in
                // declaration order still get their turn this tick.
                ServiceOutcome::Deferred => {
                    deferred = true;
                }
                ServiceOutcome::Failed(reason) => {
                    audit.line(&format!(
                        "service {ser_name} failed for request {request}: {reason}"
                    ));
                    audit
                        .middleware(json!({
                            "request": request,
                            "service": ser_name,
                            "status": "failed",
                            "end": unix_now(),
                        }))
                        .await;
                    failed = true;
                    break;
                }
                ServiceOutcome::Stopped => {
                    return Ok(Disposition::InProgress);
                }
            }
        }

        if failed {
            let dest = self.site.failed_dir(set).join(request);
            fs::rename(&req_dir, &dest)
                .with_context(|| format!("moving {request} to failed"))?;
            req_log.finish("failed");
            audit.line(&format!("request {request} FAILED"));
            audit
                .middleware(json!({"request": request, "status": "failed"}))
                .await;
            if let Err(e) = audit.write_request_log(&req_log) {
                warn!(request, error = %e, "failed to write request log");
            }
            return Ok(Disposition::Failed);
        }

        if deferred || !manifest.all_services_done(&req_dir) {
            return Ok(Disposition::InProgress);
        }

        manifest.curserv = CurrentService::PostServices;
        store_manifest(&manifest_path, &manifest)?;
        let dest = self.site.finished_dir(set).join(request);
        fs::rename(&req_dir, &dest)
            .with_context(|| format!("moving {request} to finished"))?;
        req_log.finish("success");
        audit.line(&format!("request {request} finished"));
        audit
            .middleware(json!({"request": request, "status": "success"}))
            .await;

        self.final_destination(set_key, &manifest, request, &dest, audit)
            .await;

        if let Err(e) = audit.write_request_log(&req_log) {
            warn!(request, error = %e, "failed to write request log");
        }
        Ok(Disposition::Finished)
    }

    /// Drive one service through its remaining iterations:
    /// launch -> wait -> result actions -> remove -> persist -> egress ->
    /// delete, until the iteration controller says stop.
    #[allow(clippy::too_many_arguments)]
    async fn run_service(
        &self,
        set_key: &str,
        set: &SetConfig,
        request: &str,
        req_dir: &Path,
        results_dir: &Path,
        manifest_path: &Path,
        manifest: &mut Manifest,
        ser_name: &str,
        req_log: &mut RequestLog,
        audit: &Audit,
        stop: &AtomicBool,
    ) -> Result<ServiceOutcome> {
        let stop_marker = req_dir.join(STOP_MARKER);
        loop {
            if stop.load(Ordering::Relaxed) {
                return Ok(ServiceOutcome::Stopped);
            }
            let service = manifest.services[ser_name].clone();
            let cur_iter = service.cur_iter();
            if !should_iterate(service.iterative.as_ref(), cur_iter, &stop_marker) {
                return Ok(ServiceOutcome::Completed);
            }

            let instance = service_instance_name(ser_name, cur_iter);
            match self.engine.service_exists(&instance).await {
                Ok(false) => {}
                Ok(true) => {
                    return Ok(ServiceOutcome::Failed(format!(
                        "a service named {instance} already exists"
                    )));
                }
                Err(e) => return Ok(ServiceOutcome::Failed(e.to_string())),
            }

            let clamped = match admit(set, manifest, ser_name, req_dir) {
                AdmissionOutcome::Admitted(c) => c,
                AdmissionOutcome::Deferred(reason) => {
                    audit.line(&format!(
                        "service {ser_name} of request {request} deferred: {reason}"
                    ));
                    return Ok(ServiceOutcome::Deferred);
                }
                AdmissionOutcome::Rejected(e) => {
                    return Ok(ServiceOutcome::Failed(e.to_string()));
                }
            };

            if let Err(e) = launch_service(
                self.engine.as_ref(),
                set,
                clamped,
                &instance,
                &service,
                request,
                req_dir,
            )
            .await
            {
                return Ok(ServiceOutcome::Failed(e.to_string()));
            }
            req_log.service_started(&instance, clamped.tasks);
            audit.line(&format!(
                "launched service {instance} for request {request} with {} tasks",
                clamped.tasks
            ));
            audit
                .middleware(json!({
                    "request": request,
                    "service": instance,
                    "tasks": clamped.tasks,
                    "start": unix_now(),
                }))
                .await;

            if !await_completion(self.engine.as_ref(), &instance, clamped.tasks, clamped.ttl).await
            {
                req_log.service_finished(&instance, "failed");
                return Ok(ServiceOutcome::Failed(format!(
                    "service {instance} timed out after {}s",
                    clamped.ttl
                )));
            }
            req_log.service_finished(&instance, "succeed");
            audit.line(&format!("finished service {instance} for request {request}"));
            audit
                .middleware(json!({
                    "request": request,
                    "service": instance,
                    "end": unix_now(),
                    "status": "succeed",
                }))
                .await;

            if let Err(e) = act_on_results(&service.results, req_dir, results_dir) {
                return Ok(ServiceOutcome::Failed(format!("result actions: {e}")));
            }
            if let Err(e) = remove_stale(&service.toremove, req_dir) {
                return Ok(ServiceOutcome::Failed(format!("stale-input removal: {e}")));
            }

            if let Some(it) = manifest
                .services
                .get_mut(ser_name)
                .and_then(|s| s.iterative.as_mut())
            {
                it.cur_iter += 1;
            }
            store_manifest(manifest_path, manifest)?;

            let post = manifest.services[ser_name].clone();
            self.deliver_sinks(
                set_key,
                request,
                req_dir,
                results_dir,
                &post,
                &instance,
                clamped,
                req_log,
                audit,
            )
            .await;

            if set.terminate == TerminatePolicy::Remove {
                if let Err(e) = self.engine.delete_service(&instance).await {
                    audit.line(&format!("failed to delete service {instance}: {e}"));
                }
            }
        }
    }

    /// Per-iteration egress in deterministic order: object store first, then
    /// the cross-site sinks in manifest order, then the SFTP sinks. Sink
    /// failures are contained to the sink.
    #[allow(clippy::too_many_arguments)]
    async fn deliver_sinks(
        &self,
        set_key: &str,
        request: &str,
        req_dir: &Path,
        results_dir: &Path,
        service: &Service,
        instance: &str,
        clamped: Clamped,
        req_log: &mut RequestLog,
        audit: &Audit,
    ) {
        let Some(iterative) = service.iterative.as_ref() else {
            return;
        };
        let state = IterationState::from_request(iterative.cur_iter, iterative.max_rep, req_dir);
        let artifact_id = Uuid::new_v4().to_string();

        if let Some(sink) = &service.s3 {
            match should_transfer(&sink.transfer.condition, &state) {
                Ok(true) => match egress::s3::transfer(sink, results_dir).await {
                    Ok(n) if n > 0 => {
                        audit.line(&format!("transferred results to s3 bucket {}", sink.bucket));
                        req_log.sink_sent(
                            instance,
                            "s3",
                            SinkRecord {
                                sent: unix_now(),
                                res_file: None,
                                destination: Some(sink.bucket.clone()),
                                sha256: None,
                            },
                        );
                        audit
                            .middleware(json!({
                                "request": request,
                                "service": instance,
                                "s3": {"sent": unix_now()},
                            }))
                            .await;
                    }
                    Ok(_) => {}
                    Err(e) => audit.line(&format!("s3 transfer failed: {e}")),
                },
                Ok(false) => {}
                Err(e) => audit.line(&format!("bad s3 transfer condition: {e}")),
            }
        }

        for sink in &service.nifi {
            match should_transfer(&sink.transfer.condition, &state) {
                Ok(true) => {
                    let Some(transport) = self.transports.get(set_key) else {
                        audit.line("cross-site sink declared but no transport configured");
                        continue;
                    };
                    match egress::cross_site_transfer(
                        transport.as_ref(),
                        sink,
                        results_dir,
                        &artifact_id,
                        clamped.ttl,
                    )
                    .await
                    {
                        Ok(artifact) => {
                            audit.line(&format!(
                                "results {} shipped cross-site to {}",
                                artifact.file_name, sink.target_uri
                            ));
                            req_log.sink_sent(
                                instance,
                                "nifi",
                                SinkRecord {
                                    sent: unix_now(),
                                    res_file: Some(artifact.file_name.clone()),
                                    destination: Some(sink.target_uri.clone()),
                                    sha256: Some(artifact.sha256),
                                },
                            );
                            audit
                                .middleware(json!({
                                    "request": request,
                                    "service": instance,
                                    "nifi": {"sent": unix_now(), "res_file": artifact.file_name},
                                }))
                                .await;
                        }
                        Err(e) => {
                            audit.line(&format!("cross-site transfer failed: {e}"));
                            transport.cleanup().await;
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => audit.line(&format!("bad cross-site transfer condition: {e}")),
            }
        }

        for sink in &service.sftp {
            match should_transfer(&sink.transfer.condition, &state) {
                Ok(true) => match egress::sftp::transfer(sink, results_dir).await {
                    Ok(n) if n > 0 => {
                        audit.line(&format!("transferred results to sftp server {}", sink.host));
                        req_log.sink_sent(
                            instance,
                            "sftp",
                            SinkRecord {
                                sent: unix_now(),
                                res_file: None,
                                destination: Some(sink.host.clone()),
                                sha256: None,
                            },
                        );
                        audit
                            .middleware(json!({
                                "request": request,
                                "service": instance,
                                "sftp": {"sent": unix_now(), "sftp_server": sink.host},
                            }))
                            .await;
                    }
                    Ok(_) => {}
                    Err(e) => audit.line(&format!("sftp transfer failed to {}: {e}", sink.host)),
                },
                Ok(false) => {}
                Err(e) => audit.line(&format!("bad sftp transfer condition: {e}")),
            }
        }
    }

    /// Final-destination egress after the request landed in `finished/`.
    async fn final_destination(
        &self,
        set_key: &str,
        manifest: &Manifest,
        request: &str,
        finished_dir: &Path,
        audit: &Audit,
    ) {
        let Some(fin) = manifest.fin_dest.as_ref() else {
            return;
        };
        if !fin.transfer {
            return;
        }
        let results_dir = finished_dir.join(self.site.results_name());
        let artifact_id = Uuid::new_v4().to_string();

        if let Some(sink) = &fin.s3 {
            match egress::s3::transfer(sink, &results_dir).await {
                Ok(_) => audit.line(&format!(
                    "final results of {request} transferred to s3 bucket {}",
                    sink.bucket
                )),
                Err(e) => audit.line(&format!("final s3 transfer failed: {e}")),
            }
        }
        if let Some(sink) = &fin.nifi {
            if let Some(transport) = self.transports.get(set_key) {
                match egress::cross_site_transfer(
                    transport.as_ref(),
                    sink,
                    &results_dir,
                    &artifact_id,
                    3600,
                )
                .await
                {
                    Ok(artifact) => audit.line(&format!(
                        "final results {} of {request} shipped cross-site",
                        artifact.file_name
                    )),
                    Err(e) => {
                        audit.line(&format!("final cross-site transfer failed: {e}"));
                        transport.cleanup().await;
                    }
                }
            } else {
                audit.line("final cross-site sink declared but no transport configured");
            }
        }
        if let Some(sink) = &fin.sftp {
            match egress::sftp::transfer(sink, &results_dir).await {
                Ok(_) => audit.line(&format!(
                    "final results of {request} transferred to sftp server {}",
                    sink.host
                )),
                Err(e) => audit.line(&format!("final sftp transfer failed: {e}")),
            }
        }
    }
}

/// The long-lived scheduler worker: one pass per `proc_int` seconds until
/// the stop flag is raised.
pub async fn run_loop(scheduler: &Scheduler, sets: &[String], stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        if let Err(e) = scheduler.run_once(sets, stop).await {
            warn!(error = %e, "scheduler pass failed");
        }
        tokio::time::sleep(Duration::from_secs(scheduler.site.domains.proc_int)).await;
    }
    info!("scheduler loop stopped");
}
