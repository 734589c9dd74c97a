//! Project orchestrator

use super::config::{ProjectConfig, ServiceSpec};
use super::parser::ProjectParser;
use super::report::{DeploymentOutcome, DeploymentReport, ServiceReport};
use super::resolver::DependencyGraph;
use crate::cancel::{CancelHandle, CancelToken};
use crate::error::{ErrorKind, FailureRecord, Result, WardenError};
use crate::runtime::Runtime;
use crate::storage::{Attachment, VolumeManager};
use crate::supervisor::{
    InstanceStatus, LifecycleEvent, ServiceState, ServiceSupervisor, SupervisorContext,
    SupervisorHandle,
};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

/// Label recorded on volumes created by a project
pub const PROJECT_LABEL: &str = "warden.project";

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Upper bound on each layer barrier
    pub startup_timeout: Option<Duration>,
    /// Capacity of the lifecycle event channel
    pub event_capacity: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            startup_timeout: None,
            event_capacity: 1024,
        }
    }
}

/// How a layer barrier ended
enum LayerResult {
    Settled,
    Failed(Vec<String>),
    Cancelled,
}

/// Project orchestrator
pub struct Orchestrator {
    /// Project name
    project_name: String,
    /// Validated configuration
    config: ProjectConfig,
    /// Start layers, resolved once
    graph: DependencyGraph,
    /// Volume registry
    volumes: Arc<VolumeManager>,
    /// What supervisors share
    ctx: SupervisorContext,
    options: OrchestratorOptions,
    /// Live supervisors by service
    supervisors: Mutex<BTreeMap<String, SupervisorHandle>>,
    /// Final status of instances already shut down
    retired: Mutex<BTreeMap<String, InstanceStatus>>,
    /// Failures raised before a supervisor existed
    failures: Mutex<BTreeMap<String, FailureRecord>>,
    /// Outcome of the last `up`
    outcome: Mutex<Option<DeploymentOutcome>>,
    cancel: CancelHandle,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(
        project_name: &str,
        config: ProjectConfig,
        volumes: Arc<VolumeManager>,
        runtime: Arc<dyn Runtime>,
    ) -> Result<Self> {
        Self::with_options(project_name, config, volumes, runtime, OrchestratorOptions::default())
    }

    /// Create a new orchestrator with explicit options
    pub fn with_options(
        project_name: &str,
        config: ProjectConfig,
        volumes: Arc<VolumeManager>,
        runtime: Arc<dyn Runtime>,
        options: OrchestratorOptions,
    ) -> Result<Self> {
        for warning in ProjectParser::validate_services(&config)? {
            tracing::warn!("{}", warning);
        }
        let graph = DependencyGraph::new(config.services.values())?;
        let (events, _) = broadcast::channel(options.event_capacity.max(1));

        Ok(Self {
            project_name: project_name.to_string(),
            config,
            graph,
            volumes,
            ctx: SupervisorContext { runtime, events },
            options,
            supervisors: Mutex::new(BTreeMap::new()),
            retired: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(BTreeMap::new()),
            outcome: Mutex::new(None),
            cancel: CancelHandle::new(),
        })
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Handle that cancels a running `up`
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Receive lifecycle events of every instance
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.ctx.events.subscribe()
    }

    /// Bring the project up, layer by layer
    pub async fn up(&self) -> Result<DeploymentReport> {
        tracing::info!("Starting project: {}", self.project_name);

        let mut token = self.cancel.token();
        let layers = self.graph.layers();
        let mut outcome = DeploymentOutcome::Healthy;

        for (index, layer) in layers.iter().enumerate() {
            if token.is_cancelled() {
                outcome = DeploymentOutcome::Cancelled;
                break;
            }
            tracing::info!(
                "Starting layer {}/{}: {}",
                index + 1,
                layers.len(),
                layer.join(", ")
            );

            let mut started = Vec::new();
            for name in layer {
                if token.is_cancelled() {
                    outcome = DeploymentOutcome::Cancelled;
                    break;
                }
                match self.start_service(name).await {
                    Ok(handle) => started.push(handle),
                    Err(err) => {
                        tracing::error!("Cannot start {}: {}", name, err);
                        self.record_failure(name, &err)?;
                        outcome = match err.kind() {
                            ErrorKind::Volume => DeploymentOutcome::Aborted,
                            _ => DeploymentOutcome::PartialFailure,
                        };
                        break;
                    }
                }
            }

            // Members already started still settle before the halt
            match self.await_layer(&started, &mut token).await? {
                LayerResult::Settled => {}
                LayerResult::Failed(failed) => {
                    tracing::error!("Layer {} failed: {}", index + 1, failed.join(", "));
                    if outcome == DeploymentOutcome::Healthy {
                        outcome = DeploymentOutcome::PartialFailure;
                    }
                }
                LayerResult::Cancelled => outcome = DeploymentOutcome::Cancelled,
            }

            if outcome != DeploymentOutcome::Healthy {
                break;
            }
        }

        if outcome == DeploymentOutcome::Cancelled {
            tracing::info!("Deployment of {} cancelled, stopping", self.project_name);
            self.stop_all().await?;
        }

        *lock(&self.outcome, "outcome")? = Some(outcome);
        tracing::info!("Project {} is {}", self.project_name, outcome);
        self.report(outcome)
    }

    /// Stop every instance in reverse dependency order and return that order
    pub async fn down(&self, remove_volumes: bool) -> Result<Vec<String>> {
        tracing::info!("Stopping project: {}", self.project_name);

        let order = self.stop_all().await?;

        if remove_volumes {
            for name in self.project_volumes() {
                match self.volumes.remove(&name, false) {
                    Ok(()) | Err(WardenError::VolumeNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(order)
    }

    /// Current report of the project
    pub fn status(&self) -> Result<DeploymentReport> {
        let last = *lock(&self.outcome, "outcome")?;
        let mut report = self.report(last.unwrap_or(DeploymentOutcome::Healthy))?;
        if last.is_none() && report.services.iter().any(|s| s.state != ServiceState::Healthy) {
            report.outcome = DeploymentOutcome::PartialFailure;
        }
        Ok(report)
    }

    /// Stop a service and start it afresh, waiting until it settles
    pub async fn redeploy(&self, service_name: &str) -> Result<InstanceStatus> {
        if !self.config.services.contains_key(service_name) {
            return Err(WardenError::ServiceNotFound(service_name.to_string()));
        }
        tracing::info!("Redeploying service: {}", service_name);

        let previous = lock(&self.supervisors, "supervisor")?.remove(service_name);
        if let Some(handle) = previous {
            self.retire(handle).await?;
        }
        lock(&self.retired, "retired instance")?.remove(service_name);
        lock(&self.failures, "failure")?.remove(service_name);

        let handle = self.start_service(service_name).await.map_err(|err| {
            if let Err(e) = self.record_failure(service_name, &err) {
                tracing::warn!("{}", e);
            }
            err
        })?;
        Ok(handle.wait_settled().await)
    }

    /// Attach volumes and spawn a supervisor; a live instance is reused
    async fn start_service(&self, name: &str) -> Result<SupervisorHandle> {
        let existing = lock(&self.supervisors, "supervisor")?.get(name).cloned();
        if let Some(handle) = existing.filter(|h| h.state() != ServiceState::Stopped) {
            return Ok(handle);
        }

        let spec = self
            .config
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| WardenError::ServiceNotFound(name.to_string()))?;

        let attachments = self.attach_volumes(&spec).await?;
        let handle = ServiceSupervisor::start(spec, attachments, &self.ctx);

        let replaced = lock(&self.supervisors, "supervisor")?.insert(name.to_string(), handle.clone());
        if let Some(old) = replaced {
            self.retire(old).await?;
        }
        lock(&self.retired, "retired instance")?.remove(name);
        lock(&self.failures, "failure")?.remove(name);
        Ok(handle)
    }

    async fn attach_volumes(&self, spec: &ServiceSpec) -> Result<Vec<Attachment>> {
        let mut attachments: Vec<Attachment> = Vec::new();

        for mount in &spec.volumes {
            let labels = BTreeMap::from([(PROJECT_LABEL.to_string(), self.project_name.clone())]);
            match self
                .volumes
                .attach_with_labels(&mount.name, &mount.mount_path, labels)
                .await
            {
                Ok(attachment) => attachments.push(attachment),
                Err(err) => {
                    for attached in &attachments {
                        self.volumes.detach(&attached.record.name)?;
                    }
                    return Err(match err {
                        WardenError::Volume(_) | WardenError::VolumeNotFound(_) => err,
                        other => WardenError::Volume(format!(
                            "Cannot attach {} to {}: {}",
                            mount.name, spec.name, other
                        )),
                    });
                }
            }
        }

        Ok(attachments)
    }

    /// Wait until every member is healthy or stopped
    async fn await_layer(
        &self,
        handles: &[SupervisorHandle],
        token: &mut CancelToken,
    ) -> Result<LayerResult> {
        if handles.is_empty() {
            return Ok(LayerResult::Settled);
        }

        let barrier = join_all(handles.iter().map(|h| h.wait_settled()));
        let statuses = match self.options.startup_timeout {
            Some(limit) => tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(LayerResult::Cancelled),
                settled = tokio::time::timeout(limit, barrier) => settled.ok(),
            },
            None => tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(LayerResult::Cancelled),
                settled = barrier => Some(settled),
            },
        };

        let statuses = match statuses {
            Some(statuses) => statuses,
            None => return self.expire_layer(handles, self.options.startup_timeout).await,
        };

        let failed: Vec<String> = statuses
            .into_iter()
            .filter(|s| s.state != ServiceState::Healthy)
            .map(|s| s.name)
            .collect();

        if failed.is_empty() {
            Ok(LayerResult::Settled)
        } else {
            Ok(LayerResult::Failed(failed))
        }
    }

    /// Stop members that missed the startup timeout
    async fn expire_layer(
        &self,
        handles: &[SupervisorHandle],
        limit: Option<Duration>,
    ) -> Result<LayerResult> {
        let mut failed = Vec::new();

        for handle in handles {
            match handle.state() {
                ServiceState::Healthy => {}
                ServiceState::Stopped => failed.push(handle.name().to_string()),
                state => {
                    let err = WardenError::Startup(format!(
                        "{} still {} after startup timeout of {:?}",
                        handle.name(),
                        state,
                        limit.unwrap_or_default()
                    ));
                    tracing::error!("{}", err);
                    self.record_failure(handle.name(), &err)?;
                    handle.stop().await;
                    failed.push(handle.name().to_string());
                }
            }
        }

        Ok(LayerResult::Failed(failed))
    }

    /// Stop live instances layer by layer, dependents first
    async fn stop_all(&self) -> Result<Vec<String>> {
        let mut order = Vec::new();

        for layer in self.graph.layers().iter().rev() {
            let handles: Vec<SupervisorHandle> = {
                let mut supervisors = lock(&self.supervisors, "supervisor")?;
                layer
                    .iter()
                    .rev()
                    .filter_map(|name| supervisors.remove(name))
                    .collect()
            };
            if handles.is_empty() {
                continue;
            }

            order.extend(handles.iter().map(|h| h.name().to_string()));
            for result in join_all(handles.into_iter().map(|h| self.retire(h))).await {
                result?;
            }
        }

        Ok(order)
    }

    /// Stop an instance, release its volumes and keep its final status
    async fn retire(&self, handle: SupervisorHandle) -> Result<()> {
        let status = handle.stop().await;
        for attachment in handle.attachments() {
            self.volumes.detach(&attachment.record.name)?;
        }
        tracing::debug!("Retired {} ({})", status.name, status.state);
        lock(&self.retired, "retired instance")?.insert(status.name.clone(), status);
        Ok(())
    }

    fn record_failure(&self, name: &str, err: &WardenError) -> Result<()> {
        lock(&self.failures, "failure")?.insert(name.to_string(), FailureRecord::from(err));
        Ok(())
    }

    /// Volumes mounted by any service, deduplicated
    fn project_volumes(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .config
            .services
            .values()
            .flat_map(|s| s.volumes.iter().map(|m| m.name.clone()))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn report(&self, outcome: DeploymentOutcome) -> Result<DeploymentReport> {
        let supervisors = lock(&self.supervisors, "supervisor")?;
        let retired = lock(&self.retired, "retired instance")?;
        let failures = lock(&self.failures, "failure")?;

        let services = self
            .graph
            .start_order()
            .into_iter()
            .map(|name| {
                let status = supervisors
                    .get(&name)
                    .map(|h| h.status())
                    .or_else(|| retired.get(&name).cloned());
                let failure = failures.get(&name).cloned();

                match status {
                    Some(status) => ServiceReport {
                        state: status.state,
                        restart_count: status.restart_count,
                        last_exit_code: status.last_exit_code,
                        last_error: failure.or(status.last_error),
                        name,
                    },
                    None => ServiceReport {
                        state: ServiceState::Pending,
                        restart_count: 0,
                        last_exit_code: None,
                        last_error: failure,
                        name,
                    },
                }
            })
            .collect();

        Ok(DeploymentReport {
            project: self.project_name.clone(),
            outcome,
            services,
        })
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| WardenError::Lock(format!("Failed to acquire {} lock", what)))
}
