//! Project file configuration types

use super::duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

/// Default interval between health probes
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);
/// Default timeout for a single health probe
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
/// Default consecutive failures before a service is unhealthy
pub const DEFAULT_HEALTH_RETRIES: u32 = 3;
/// Default time between SIGTERM and a forced kill
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Project file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Services, keyed by service name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
}

impl ProjectConfig {
    /// Build a project from service specs
    pub fn from_services(services: impl IntoIterator<Item = ServiceSpec>) -> Self {
        Self {
            name: None,
            services: services.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    /// Copy each map key into the owning spec's `name`
    pub fn assign_names(&mut self) {
        for (name, spec) in self.services.iter_mut() {
            spec.name = name.clone();
        }
    }
}

/// Declarative description of one managed service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceSpec {
    /// Service name (the key in `services`)
    #[serde(skip)]
    pub name: String,
    /// Command that starts the service
    pub start_command: CommandSpec,
    /// Services that must be healthy first
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    /// Readiness probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
    /// What to do when the service fails; `on-failure` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
    /// Backoff override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_backoff: Option<BackoffSpec>,
    /// Named volumes to mount, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMountSpec>,
    /// Environment passed to the process
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// Working directory of the process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Time between SIGTERM and a forced kill
    #[serde(
        default,
        with = "duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub stop_grace_period: Option<Duration>,
}

impl ServiceSpec {
    /// Create a new service spec with default policy and no dependencies
    pub fn new(name: &str, start_command: CommandSpec) -> Self {
        Self {
            name: name.to_string(),
            start_command,
            depends_on: BTreeSet::new(),
            health_check: None,
            restart_policy: None,
            restart_backoff: None,
            volumes: Vec::new(),
            environment: BTreeMap::new(),
            working_dir: None,
            stop_grace_period: None,
        }
    }

    /// Add a dependency
    pub fn depends_on(mut self, service: &str) -> Self {
        self.depends_on.insert(service.to_string());
        self
    }

    /// Set health check
    pub fn health_check(mut self, check: HealthCheckSpec) -> Self {
        self.health_check = Some(check);
        self
    }

    /// Set restart policy
    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = Some(policy);
        self
    }

    /// Set restart backoff
    pub fn restart_backoff(mut self, backoff: BackoffSpec) -> Self {
        self.restart_backoff = Some(backoff);
        self
    }

    /// Add a volume mount
    pub fn volume(mut self, name: &str, mount_path: &str) -> Self {
        self.volumes.push(VolumeMountSpec {
            name: name.to_string(),
            mount_path: PathBuf::from(mount_path),
        });
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    pub fn effective_restart_policy(&self) -> RestartPolicy {
        self.restart_policy.unwrap_or_default()
    }

    /// Effective stop grace period
    pub fn grace_period(&self) -> Duration {
        self.stop_grace_period.unwrap_or(DEFAULT_STOP_GRACE_PERIOD)
    }

    /// Effective health check, `None` when absent or disabled
    pub fn effective_health_check(&self) -> Option<&HealthCheckSpec> {
        self.health_check.as_ref().filter(|hc| !hc.disable)
    }
}

/// Command configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

impl CommandSpec {
    /// Shell form
    pub fn shell(cmd: &str) -> Self {
        CommandSpec::Shell(cmd.to_string())
    }

    /// Exec form
    pub fn exec<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::Exec(args.into_iter().map(Into::into).collect())
    }

    /// Argument vector; the shell form runs through `/bin/sh -c`
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            CommandSpec::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()],
            CommandSpec::Exec(args) => args.clone(),
        }
    }

    /// Whether there is nothing to run
    pub fn is_empty(&self) -> bool {
        match self {
            CommandSpec::Shell(s) => s.trim().is_empty(),
            CommandSpec::Exec(args) => args.first().map_or(true, |a| a.trim().is_empty()),
        }
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandSpec::Shell(s) => write!(f, "{}", s),
            CommandSpec::Exec(args) => write!(f, "{}", args.join(" ")),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HealthCheckSpec {
    /// Probe command; exit status 0 means healthy
    pub command: CommandSpec,
    /// Interval between probes
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
    /// Timeout for a single probe
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Consecutive failures before the service is unhealthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Grace period in which failures are not counted
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub start_period: Option<Duration>,
    /// Overall wait ceiling, defaults to `interval * (retries + 1)`
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub ceiling: Option<Duration>,
    /// Treat as if no check were configured
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable: bool,
}

impl HealthCheckSpec {
    /// Create a health check with default timings
    pub fn new(command: CommandSpec) -> Self {
        Self {
            command,
            interval: None,
            timeout: None,
            retries: None,
            start_period: None,
            ceiling: None,
            disable: false,
        }
    }

    /// Set interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Set probe timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set retries
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Set start period
    pub fn start_period(mut self, start_period: Duration) -> Self {
        self.start_period = Some(start_period);
        self
    }

    /// Set ceiling
    pub fn ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = Some(ceiling);
        self
    }

    pub fn effective_interval(&self) -> Duration {
        self.interval.unwrap_or(DEFAULT_HEALTH_INTERVAL)
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_HEALTH_TIMEOUT)
    }

    pub fn effective_retries(&self) -> u32 {
        self.retries.unwrap_or(DEFAULT_HEALTH_RETRIES).max(1)
    }

    pub fn effective_start_period(&self) -> Duration {
        self.start_period.unwrap_or(Duration::ZERO)
    }

    /// Overall wait ceiling, measured after the start period
    pub fn effective_ceiling(&self) -> Duration {
        self.ceiling.unwrap_or_else(|| {
            self.effective_interval()
                .saturating_mul(self.effective_retries().saturating_add(1))
        })
    }
}

/// Restart policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart
    Never,
    /// Restart with bounded attempts
    #[default]
    OnFailure,
    /// Restart until stopped
    Always,
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::Never => write!(f, "never"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
            RestartPolicy::Always => write!(f, "always"),
        }
    }
}

/// Restart backoff override
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BackoffSpec {
    /// First delay
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub initial: Option<Duration>,
    /// Delay cap
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub max: Option<Duration>,
    /// Attempts allowed under `on-failure`, counting the first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Jitter fraction in `[0, 1]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
}

/// Named volume mounted into a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VolumeMountSpec {
    /// Volume name
    pub name: String,
    /// Path the service expects the volume at
    pub mount_path: PathBuf,
}
