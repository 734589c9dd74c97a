//! Deployment reports

use crate::error::FailureRecord;
use crate::supervisor::ServiceState;
use serde::{Deserialize, Serialize};

/// Overall result of bringing a project up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentOutcome {
    /// Every service is healthy
    Healthy,
    /// At least one service failed; later layers were not started
    PartialFailure,
    /// A volume could not be attached
    Aborted,
    /// Cancellation was requested
    Cancelled,
}

impl std::fmt::Display for DeploymentOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentOutcome::Healthy => write!(f, "healthy"),
            DeploymentOutcome::PartialFailure => write!(f, "partial failure"),
            DeploymentOutcome::Aborted => write!(f, "aborted"),
            DeploymentOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Final state of one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceReport {
    pub name: String,
    pub state: ServiceState,
    pub restart_count: u32,
    pub last_exit_code: Option<i32>,
    pub last_error: Option<FailureRecord>,
}

/// Partial-failure report for a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentReport {
    pub project: String,
    pub outcome: DeploymentOutcome,
    /// Services in start order
    pub services: Vec<ServiceReport>,
}

impl DeploymentReport {
    pub fn service(&self, name: &str) -> Option<&ServiceReport> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Names of services in `state`
    pub fn in_state(&self, state: ServiceState) -> Vec<&str> {
        self.services
            .iter()
            .filter(|s| s.state == state)
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn is_healthy(&self) -> bool {
        self.outcome == DeploymentOutcome::Healthy
    }
}

impl std::fmt::Display for DeploymentReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Project {}: {}", self.project, self.outcome)?;
        writeln!(f, "{:<20} {:<16} {:<9} {:<5} ERROR", "SERVICE", "STATE", "RESTARTS", "EXIT")?;
        for service in &self.services {
            let exit = service
                .last_exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            let error = match (&service.last_error, service.state) {
                (Some(err), state) if state != ServiceState::Healthy => err.to_string(),
                _ => String::new(),
            };
            writeln!(
                f,
                "{:<20} {:<16} {:<9} {:<5} {}",
                service.name,
                service.state.to_string(),
                service.restart_count,
                exit,
                error
            )?;
        }
        Ok(())
    }
}
