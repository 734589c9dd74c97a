//! Process runtime
//!
//! The seam between the supervisor and the external processes it manages.
//! [`ShellRuntime`] launches real processes; tests use a scripted runtime.

pub mod process;
#[cfg(test)]
pub(crate) mod scripted;

pub use process::ShellRuntime;

use crate::compose::config::{CommandSpec, ServiceSpec};
use crate::error::Result;
use crate::storage::Attachment;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Everything needed to launch one service process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Service name
    pub service: String,
    /// Arguments (first is the executable)
    pub argv: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
    /// Attached volumes
    pub mounts: Vec<Attachment>,
    /// Time between the stop signal and a forced kill
    pub grace_period: Duration,
}

impl LaunchSpec {
    /// Build a launch spec from a service and its attached volumes
    pub fn new(spec: &ServiceSpec, mounts: Vec<Attachment>) -> Self {
        let mut env = spec.environment.clone();
        for mount in &mounts {
            let key = env_key(&mount.record.name);
            env.insert(
                format!("WARDEN_VOLUME_{}", key),
                mount.record.backing_path.display().to_string(),
            );
            env.insert(
                format!("WARDEN_MOUNT_{}", key),
                mount.mount_path.display().to_string(),
            );
        }

        Self {
            service: spec.name.clone(),
            argv: spec.start_command.to_argv(),
            env,
            working_dir: spec.working_dir.clone(),
            mounts,
            grace_period: spec.grace_period(),
        }
    }
}

/// Uppercase a name and replace anything not alphanumeric with `_`
fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Launches service processes and runs probe commands
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Launch a service process
    async fn spawn(&self, launch: &LaunchSpec) -> Result<Box<dyn ServiceProcess>>;

    /// Run a probe command to completion; `Ok(true)` means it exited with 0
    async fn probe(&self, launch: &LaunchSpec, command: &CommandSpec) -> Result<bool>;
}

/// A running service process
#[async_trait]
pub trait ServiceProcess: Send {
    /// Wait for the process to exit and return its exit code. Cancel safe.
    async fn wait(&mut self) -> Result<i32>;

    /// Ask the process to stop, killing it after `grace`; returns the exit code
    async fn terminate(&mut self, grace: Duration) -> Result<i32>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::VolumeRecord;
    use chrono::Utc;

    #[test]
    fn test_launch_spec_exposes_mounts() {
        let spec = ServiceSpec::new("db", CommandSpec::exec(["postgres"]))
            .env("POSTGRES_DB", "shop")
            .volume("pg-data", "/var/lib/postgresql/data");
        let mount = Attachment {
            record: VolumeRecord {
                name: "pg-data".to_string(),
                backing_path: PathBuf::from("/srv/warden/volumes/pg-data/_data"),
                created_at: Utc::now(),
                labels: BTreeMap::new(),
            },
            mount_path: PathBuf::from("/var/lib/postgresql/data"),
            created: true,
        };

        let launch = LaunchSpec::new(&spec, vec![mount]);
        assert_eq!(launch.argv, vec!["postgres"]);
        assert_eq!(launch.env["POSTGRES_DB"], "shop");
        assert_eq!(
            launch.env["WARDEN_VOLUME_PG_DATA"],
            "/srv/warden/volumes/pg-data/_data"
        );
        assert_eq!(launch.env["WARDEN_MOUNT_PG_DATA"], "/var/lib/postgresql/data");
    }
}
