//! Instance state and lifecycle events

use crate::error::FailureRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Service instance state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    /// Not started yet
    #[default]
    Pending,
    /// Process is being launched
    Starting,
    /// Process launched, waiting for readiness
    HealthChecking,
    /// Ready to serve dependents
    Healthy,
    /// Last run failed; restart policy pending
    Failed,
    /// Terminal
    Stopped,
}

impl ServiceState {
    /// Whether the transition `self -> to` is part of the state machine
    pub fn can_transition_to(self, to: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, to),
            (Pending, Starting)
                | (Pending, Stopped)
                | (Starting, HealthChecking)
                | (Starting, Failed)
                | (Starting, Stopped)
                | (HealthChecking, Healthy)
                | (HealthChecking, Failed)
                | (HealthChecking, Stopped)
                | (Healthy, Failed)
                | (Healthy, Stopped)
                | (Failed, Starting)
                | (Failed, Stopped)
        )
    }

    /// Healthy or stopped; what a layer barrier waits for
    pub fn is_settled(self) -> bool {
        matches!(self, ServiceState::Healthy | ServiceState::Stopped)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Pending => write!(f, "pending"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::HealthChecking => write!(f, "health-checking"),
            ServiceState::Healthy => write!(f, "healthy"),
            ServiceState::Failed => write!(f, "failed"),
            ServiceState::Stopped => write!(f, "stopped"),
        }
    }
}

/// A state transition of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub service_name: String,
    pub from_state: ServiceState,
    pub to_state: ServiceState,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of a service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    /// Instance ID
    pub id: String,
    /// Service name
    pub name: String,
    /// Current state
    pub state: ServiceState,
    /// Restarts since the last redeploy
    pub restart_count: u32,
    /// Exit code of the last process run
    pub last_exit_code: Option<i32>,
    /// Last failure
    pub last_error: Option<FailureRecord>,
    /// Backoff delays waited, in order
    #[serde(with = "millis_vec")]
    pub backoff_history: Vec<Duration>,
    /// Restart attempts were exhausted
    pub fatal: bool,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl InstanceStatus {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            state: ServiceState::Pending,
            restart_count: 0,
            last_exit_code: None,
            last_error: None,
            backoff_history: Vec::new(),
            fatal: false,
            created_at: Utc::now(),
        }
    }
}

mod millis_vec {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(value.iter().map(|d| d.as_millis() as u64))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
        let millis = Vec::<u64>::deserialize(deserializer)?;
        Ok(millis.into_iter().map(Duration::from_millis).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopped_is_terminal() {
        use ServiceState::*;
        for to in [Pending, Starting, HealthChecking, Healthy, Failed, Stopped] {
            assert!(!Stopped.can_transition_to(to));
        }
    }

    #[test]
    fn test_healthy_only_from_health_checking() {
        use ServiceState::*;
        for from in [Pending, Starting, Healthy, Failed, Stopped] {
            assert!(!from.can_transition_to(Healthy));
        }
        assert!(HealthChecking.can_transition_to(Healthy));
    }

    #[test]
    fn test_status_serializes_backoff_as_millis() {
        let mut status = InstanceStatus::new("id", "api");
        status.backoff_history = vec![Duration::from_millis(1500)];
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["backoff_history"][0], 1500);
        assert_eq!(json["state"], "pending");
    }
}
