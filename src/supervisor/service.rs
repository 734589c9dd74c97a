//! Per-instance supervisor task

use super::backoff::BackoffPolicy;
use super::state::{InstanceStatus, LifecycleEvent, ServiceState};
use crate::cancel::{CancelHandle, CancelToken};
use crate::compose::config::{RestartPolicy, ServiceSpec};
use crate::error::{FailureRecord, WardenError};
use crate::health::{HealthChecker, HealthResult};
use crate::runtime::{LaunchSpec, Runtime, ServiceProcess};
use crate::storage::Attachment;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Shared collaborators handed to each supervisor
#[derive(Clone)]
pub struct SupervisorContext {
    /// Process runtime
    pub runtime: Arc<dyn Runtime>,
    /// Lifecycle event channel
    pub events: broadcast::Sender<LifecycleEvent>,
}

/// Starts supervisor tasks
pub struct ServiceSupervisor;

impl ServiceSupervisor {
    /// Spawn a supervisor task for `spec` with its volumes already attached
    pub fn start(
        spec: ServiceSpec,
        attachments: Vec<Attachment>,
        ctx: &SupervisorContext,
    ) -> SupervisorHandle {
        let id = Uuid::new_v4().to_string();
        let (status_tx, status_rx) = watch::channel(InstanceStatus::new(&id, &spec.name));
        let stop = CancelHandle::new();

        let instance = ServiceInstance {
            launch: LaunchSpec::new(&spec, attachments.clone()),
            backoff: BackoffPolicy::from_spec(spec.restart_backoff.as_ref()),
            spec,
            state: ServiceState::Pending,
            status: status_tx,
            events: ctx.events.clone(),
            runtime: ctx.runtime.clone(),
            checker: HealthChecker::new(ctx.runtime.clone()),
        };
        let name = instance.spec.name.clone();
        let task = tokio::spawn(instance.run(stop.token()));

        SupervisorHandle {
            inner: Arc::new(HandleInner {
                name,
                attachments,
                status: status_rx,
                stop,
                task: Mutex::new(Some(task)),
            }),
        }
    }
}

struct HandleInner {
    name: String,
    attachments: Vec<Attachment>,
    status: watch::Receiver<InstanceStatus>,
    stop: CancelHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running supervisor task
#[derive(Clone)]
pub struct SupervisorHandle {
    inner: Arc<HandleInner>,
}

impl SupervisorHandle {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Volumes attached for this instance
    pub fn attachments(&self) -> &[Attachment] {
        &self.inner.attachments
    }

    /// Current snapshot
    pub fn status(&self) -> InstanceStatus {
        self.inner.status.borrow().clone()
    }

    pub fn state(&self) -> ServiceState {
        self.inner.status.borrow().state
    }

    /// Receiver for status changes
    pub fn watch(&self) -> watch::Receiver<InstanceStatus> {
        self.inner.status.clone()
    }

    /// Wait until the instance is healthy or stopped
    pub async fn wait_settled(&self) -> InstanceStatus {
        self.wait_for(|s| s.state.is_settled()).await
    }

    /// Wait until the instance reaches `state`, or stops
    pub async fn wait_for_state(&self, state: ServiceState) -> InstanceStatus {
        self.wait_for(|s| s.state == state || s.state == ServiceState::Stopped)
            .await
    }

    async fn wait_for(&self, condition: impl FnMut(&InstanceStatus) -> bool) -> InstanceStatus {
        let mut rx = self.inner.status.clone();
        let result = rx.wait_for(condition).await.map(|s| s.clone());
        // The sender only goes away when the task ends
        result.unwrap_or_else(|_| rx.borrow().clone())
    }

    /// Stop the instance and wait until it is stopped; repeated calls do nothing
    pub async fn stop(&self) -> InstanceStatus {
        self.inner.stop.cancel();

        let task = self.inner.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Supervisor task for {} ended abnormally: {}", self.inner.name, e);
            }
        }

        // A concurrent caller may still own the task
        self.wait_for(|s| s.state == ServiceState::Stopped).await
    }
}

/// How one run of the process ended
enum RunOutcome {
    /// Stop was requested
    Stopped,
    /// Exited with code 0 after being healthy
    Completed,
    /// Launch, health or runtime failure
    Failed(WardenError),
}

/// Runtime state of one service, owned by its supervisor task
struct ServiceInstance {
    spec: ServiceSpec,
    launch: LaunchSpec,
    backoff: BackoffPolicy,
    state: ServiceState,
    status: watch::Sender<InstanceStatus>,
    events: broadcast::Sender<LifecycleEvent>,
    runtime: Arc<dyn Runtime>,
    checker: HealthChecker,
}

impl ServiceInstance {
    async fn run(mut self, mut stop: CancelToken) {
        // Attempts in the current window; reset by reaching Healthy
        let mut attempt = 0u32;

        loop {
            if stop.is_cancelled() {
                self.transition(ServiceState::Stopped);
                return;
            }

            attempt = attempt.saturating_add(1);
            self.transition(ServiceState::Starting);

            let outcome = self.run_once(&mut stop, &mut attempt).await;
            let failure = match outcome {
                RunOutcome::Stopped => {
                    self.transition(ServiceState::Stopped);
                    return;
                }
                RunOutcome::Completed => None,
                RunOutcome::Failed(err) => Some(err),
            };

            self.transition(ServiceState::Failed);
            let policy = self.spec.effective_restart_policy();
            let retry = match (&failure, policy) {
                (_, RestartPolicy::Always) => true,
                (None, _) | (_, RestartPolicy::Never) => false,
                (Some(_), RestartPolicy::OnFailure) => attempt < self.backoff.max_attempts,
            };

            if !retry {
                if failure.is_some() {
                    tracing::error!(
                        "{} failed permanently after {} attempt(s) (policy {})",
                        self.spec.name,
                        attempt,
                        policy
                    );
                    self.status.send_modify(|s| s.fatal = true);
                } else {
                    tracing::info!("{} exited cleanly, not restarting", self.spec.name);
                }
                self.transition(ServiceState::Stopped);
                return;
            }

            let delay = self.backoff.delay(attempt);
            tracing::info!(
                "Restarting {} in {:?} (attempt {})",
                self.spec.name,
                delay,
                attempt.saturating_add(1)
            );
            self.status.send_modify(|s| s.backoff_history.push(delay));

            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    self.transition(ServiceState::Stopped);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            self.status.send_modify(|s| s.restart_count += 1);
        }
    }

    /// Launch the process once and follow it until it ends or is stopped
    async fn run_once(&mut self, stop: &mut CancelToken, attempt: &mut u32) -> RunOutcome {
        let mut process = match self.runtime.spawn(&self.launch).await {
            Ok(process) => process,
            Err(err) => return self.fail(err),
        };

        self.transition(ServiceState::HealthChecking);

        enum Startup {
            Stop,
            Exit(crate::error::Result<i32>),
            Health(crate::error::Result<HealthResult>),
        }

        let mut health_cancel = stop.clone();
        let check = self.spec.effective_health_check();
        let startup = tokio::select! {
            biased;
            _ = stop.cancelled() => Startup::Stop,
            exit = process.wait() => Startup::Exit(exit),
            health = self.checker.wait_healthy(&self.launch, check, &mut health_cancel) => Startup::Health(health),
        };

        match startup {
            Startup::Stop | Startup::Health(Err(WardenError::Cancelled)) => {
                self.terminate(&mut process).await;
                return RunOutcome::Stopped;
            }
            Startup::Exit(Ok(code)) => {
                self.record_exit(code);
                return self.fail(WardenError::Startup(format!(
                    "{} exited with code {} before becoming healthy",
                    self.spec.name, code
                )));
            }
            Startup::Exit(Err(err)) => return self.fail(WardenError::Startup(err.to_string())),
            Startup::Health(Ok(HealthResult::Healthy)) => {}
            Startup::Health(Ok(result)) => {
                self.terminate(&mut process).await;
                return self.fail(WardenError::HealthCheck(format!(
                    "{} health check {}",
                    self.spec.name, result
                )));
            }
            Startup::Health(Err(err)) => {
                self.terminate(&mut process).await;
                return self.fail(WardenError::HealthCheck(err.to_string()));
            }
        }

        self.transition(ServiceState::Healthy);
        // A healthy run opens a fresh attempt window, counting this run
        *attempt = 1;

        let exit = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            exit = process.wait() => Some(exit),
        };

        match exit {
            None => {
                self.terminate(&mut process).await;
                RunOutcome::Stopped
            }
            Some(Ok(0)) => {
                self.record_exit(0);
                RunOutcome::Completed
            }
            Some(Ok(code)) => {
                self.record_exit(code);
                self.fail(WardenError::RuntimeCrash(format!(
                    "{} exited with code {}",
                    self.spec.name, code
                )))
            }
            Some(Err(err)) => self.fail(WardenError::RuntimeCrash(err.to_string())),
        }
    }

    async fn terminate(&mut self, process: &mut Box<dyn ServiceProcess>) {
        match process.terminate(self.launch.grace_period).await {
            Ok(code) => self.record_exit(code),
            Err(e) => tracing::warn!("Failed to stop {}: {}", self.spec.name, e),
        }
    }

    fn record_exit(&mut self, code: i32) {
        self.status.send_modify(|s| s.last_exit_code = Some(code));
    }

    fn fail(&mut self, err: WardenError) -> RunOutcome {
        tracing::warn!("{}: {}", self.spec.name, err);
        let record = FailureRecord::from(&err);
        self.status.send_modify(|s| s.last_error = Some(record));
        RunOutcome::Failed(err)
    }

    fn transition(&mut self, to: ServiceState) {
        let from = self.state;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            tracing::error!("{}: invalid transition {} -> {}", self.spec.name, from, to);
            return;
        }

        self.state = to;
        match to {
            ServiceState::Failed => tracing::warn!("{}: {} -> {}", self.spec.name, from, to),
            _ => tracing::info!("{}: {} -> {}", self.spec.name, from, to),
        }

        self.status.send_modify(|s| s.state = to);
        // No subscribers is fine
        let _ = self.events.send(LifecycleEvent {
            service_name: self.spec.name.clone(),
            from_state: from,
            to_state: to,
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::config::{BackoffSpec, CommandSpec, HealthCheckSpec};
    use crate::error::ErrorKind;
    use crate::runtime::scripted::{ProbeScript, ScriptedRuntime, ServiceScript};
    use std::time::Duration;

    fn context(runtime: &ScriptedRuntime) -> (SupervisorContext, broadcast::Receiver<LifecycleEvent>) {
        let (events, rx) = broadcast::channel(256);
        (
            SupervisorContext {
                runtime: Arc::new(runtime.clone()),
                events,
            },
            rx,
        )
    }

    fn quick_check() -> HealthCheckSpec {
        HealthCheckSpec::new(CommandSpec::shell("probe"))
            .interval(Duration::from_millis(100))
            .timeout(Duration::from_millis(100))
            .retries(2)
    }

    fn drain(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<(ServiceState, ServiceState)> {
        let mut transitions = Vec::new();
        while let Ok(event) = rx.try_recv() {
            transitions.push((event.from_state, event.to_state));
        }
        transitions
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_start_emits_transitions() {
        let runtime = ScriptedRuntime::new();
        let (ctx, mut rx) = context(&runtime);
        let spec = ServiceSpec::new("db", CommandSpec::shell("postgres")).health_check(quick_check());

        let handle = ServiceSupervisor::start(spec, Vec::new(), &ctx);
        let status = handle.wait_settled().await;
        assert_eq!(status.state, ServiceState::Healthy);

        let status = handle.stop().await;
        assert_eq!(status.state, ServiceState::Stopped);
        assert_eq!(status.last_exit_code, Some(143));

        use ServiceState::*;
        assert_eq!(
            drain(&mut rx),
            vec![
                (Pending, Starting),
                (Starting, HealthChecking),
                (HealthChecking, Healthy),
                (Healthy, Stopped),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_policy_stops_after_one_attempt() {
        let runtime = ScriptedRuntime::new().script(
            "api",
            ServiceScript {
                spawn_failures: u32::MAX,
                ..Default::default()
            },
        );
        let (ctx, _rx) = context(&runtime);
        let spec = ServiceSpec::new("api", CommandSpec::shell("node server.js"))
            .restart_policy(RestartPolicy::Never);

        let handle = ServiceSupervisor::start(spec, Vec::new(), &ctx);
        let status = handle.wait_settled().await;

        assert_eq!(status.state, ServiceState::Stopped);
        assert!(status.fatal);
        assert_eq!(runtime.spawn_attempts("api"), 1);
        assert_eq!(status.restart_count, 0);
        assert_eq!(status.last_error.unwrap().kind, ErrorKind::Startup);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_failure_gives_up_after_max_attempts() {
        let runtime = ScriptedRuntime::new().script(
            "api",
            ServiceScript {
                probe: ProbeScript::Failing,
                ..Default::default()
            },
        );
        let (ctx, _rx) = context(&runtime);
        let spec = ServiceSpec::new("api", CommandSpec::shell("node server.js"))
            .health_check(quick_check())
            .restart_policy(RestartPolicy::OnFailure)
            .restart_backoff(BackoffSpec {
                max_attempts: Some(3),
                ..Default::default()
            });

        let handle = ServiceSupervisor::start(spec, Vec::new(), &ctx);
        let status = handle.wait_settled().await;

        assert_eq!(status.state, ServiceState::Stopped);
        assert!(status.fatal);
        assert_eq!(runtime.spawn_attempts("api"), 3);
        assert_eq!(runtime.terminations().len(), 3);
        assert_eq!(status.restart_count, 2);
        assert_eq!(status.backoff_history.len(), 2);
        assert!(status.backoff_history[0] < status.backoff_history[1]);
        assert_eq!(status.last_error.unwrap().kind, ErrorKind::HealthCheck);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_failure_recovers_from_launch_failures() {
        let runtime = ScriptedRuntime::new().script(
            "db",
            ServiceScript {
                spawn_failures: 2,
                ..Default::default()
            },
        );
        let (ctx, _rx) = context(&runtime);
        let spec = ServiceSpec::new("db", CommandSpec::shell("postgres"));

        let handle = ServiceSupervisor::start(spec, Vec::new(), &ctx);
        let status = handle.wait_settled().await;

        assert_eq!(status.state, ServiceState::Healthy);
        assert_eq!(status.restart_count, 2);
        assert!(!status.fatal);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_crash_is_restarted() {
        let runtime = ScriptedRuntime::new().script(
            "worker",
            ServiceScript {
                exit_after: Some((Duration::from_secs(5), 1)),
                ..Default::default()
            },
        );
        let (ctx, mut rx) = context(&runtime);
        let spec = ServiceSpec::new("worker", CommandSpec::shell("worker"))
            .restart_policy(RestartPolicy::OnFailure);

        let handle = ServiceSupervisor::start(spec, Vec::new(), &ctx);
        assert_eq!(handle.wait_settled().await.state, ServiceState::Healthy);
        drain(&mut rx);

        // Crash, back off, come back healthy
        let mut watch = handle.watch();
        watch.wait_for(|s| s.restart_count == 1).await.unwrap();
        let status = handle.wait_for_state(ServiceState::Healthy).await;
        assert_eq!(status.state, ServiceState::Healthy);
        assert_eq!(status.last_exit_code, Some(1));
        assert_eq!(status.last_error.as_ref().unwrap().kind, ErrorKind::RuntimeCrash);

        use ServiceState::*;
        let transitions = drain(&mut rx);
        assert_eq!(transitions[0], (Healthy, Failed));
        assert_eq!(transitions[1], (Failed, Starting));

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_exit_under_on_failure_stops() {
        let runtime = ScriptedRuntime::new().script(
            "migrate",
            ServiceScript {
                exit_after: Some((Duration::from_secs(1), 0)),
                ..Default::default()
            },
        );
        let (ctx, _rx) = context(&runtime);
        let spec = ServiceSpec::new("migrate", CommandSpec::shell("migrate"));

        let handle = ServiceSupervisor::start(spec, Vec::new(), &ctx);
        let status = handle.wait_for_state(ServiceState::Stopped).await;
        assert_eq!(status.state, ServiceState::Stopped);
        assert!(!status.fatal);
        assert_eq!(status.last_exit_code, Some(0));
        assert_eq!(runtime.spawn_attempts("migrate"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_policy_stop_interrupts_backoff() {
        let runtime = ScriptedRuntime::new().script(
            "api",
            ServiceScript {
                spawn_failures: u32::MAX,
                ..Default::default()
            },
        );
        let (ctx, _rx) = context(&runtime);
        let spec = ServiceSpec::new("api", CommandSpec::shell("api"))
            .restart_policy(RestartPolicy::Always)
            .restart_backoff(BackoffSpec {
                initial: Some(Duration::from_secs(600)),
                max: Some(Duration::from_secs(600)),
                jitter: Some(0.0),
                ..Default::default()
            });

        let handle = ServiceSupervisor::start(spec, Vec::new(), &ctx);
        let mut watch = handle.watch();
        watch.wait_for(|s| !s.backoff_history.is_empty()).await.unwrap();
        assert_eq!(handle.state(), ServiceState::Failed);

        let started = tokio::time::Instant::now();
        let status = handle.stop().await;
        assert_eq!(status.state, ServiceState::Stopped);
        assert!(!status.fatal);
        assert!(started.elapsed() < Duration::from_secs(600));
        assert_eq!(runtime.spawn_attempts("api"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_policy_keeps_retrying() {
        let runtime = ScriptedRuntime::new().script(
            "flaky",
            ServiceScript {
                spawn_failures: u32::MAX,
                ..Default::default()
            },
        );
        let (ctx, _rx) = context(&runtime);
        let spec = ServiceSpec::new("flaky", CommandSpec::shell("flaky"))
            .restart_policy(RestartPolicy::Always)
            .restart_backoff(BackoffSpec {
                max_attempts: Some(1),
                ..Default::default()
            });

        let handle = ServiceSupervisor::start(spec, Vec::new(), &ctx);
        let mut watch = handle.watch();
        watch.wait_for(|s| s.restart_count >= 10).await.unwrap();
        assert_ne!(handle.state(), ServiceState::Stopped);

        handle.stop().await;
        assert_eq!(handle.state(), ServiceState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let runtime = ScriptedRuntime::new();
        let (ctx, mut rx) = context(&runtime);
        let spec = ServiceSpec::new("db", CommandSpec::shell("postgres"));

        let handle = ServiceSupervisor::start(spec, Vec::new(), &ctx);
        handle.wait_settled().await;

        let first = handle.stop().await;
        let events_after_first = drain(&mut rx).len();
        let second = handle.stop().await;

        assert_eq!(first.state, ServiceState::Stopped);
        assert_eq!(second.state, ServiceState::Stopped);
        assert_eq!(first.last_exit_code, second.last_exit_code);
        assert!(events_after_first > 0);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(runtime.terminations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_stops_both_see_stopped() {
        let runtime = ScriptedRuntime::new();
        let (ctx, _rx) = context(&runtime);
        let spec = ServiceSpec::new("db", CommandSpec::shell("postgres")).health_check(quick_check());

        let handle = ServiceSupervisor::start(spec, Vec::new(), &ctx);
        handle.wait_settled().await;

        let other = handle.clone();
        let (first, second) = tokio::join!(handle.stop(), other.stop());
        assert_eq!(first.state, ServiceState::Stopped);
        assert_eq!(second.state, ServiceState::Stopped);
        assert_eq!(runtime.terminations(), vec!["db"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_health_check() {
        let runtime = ScriptedRuntime::new().script(
            "db",
            ServiceScript {
                probe: ProbeScript::Hang,
                ..Default::default()
            },
        );
        let (ctx, _rx) = context(&runtime);
        let spec = ServiceSpec::new("db", CommandSpec::shell("postgres"))
            .health_check(quick_check().timeout(Duration::from_secs(3600)).ceiling(Duration::from_secs(7200)));

        let handle = ServiceSupervisor::start(spec, Vec::new(), &ctx);
        handle.wait_for_state(ServiceState::HealthChecking).await;

        let status = handle.stop().await;
        assert_eq!(status.state, ServiceState::Stopped);
        assert_eq!(runtime.terminations(), vec!["db"]);
    }
}
