//! Error types for Warden

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for Warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

/// Warden error types
#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Project file parse error: {0}")]
    ConfigParse(String),

    #[error("Cyclic dependency between services: {}", format_cycle(cycle))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Startup failure: {0}")]
    Startup(String),

    #[error("Health check failure: {0}")]
    HealthCheck(String),

    #[error("Runtime crash: {0}")]
    RuntimeCrash(String),

    #[error("Volume error: {0}")]
    Volume(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_cycle(cycle: &[String]) -> String {
    let mut names: Vec<&str> = cycle.iter().map(String::as_str).collect();
    if let Some(first) = cycle.first() {
        names.push(first);
    }
    names.join(" -> ")
}

/// Coarse classification of failures, used in reports and restart decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Cyclic or unknown dependency, malformed project file
    Configuration,
    /// Process failed to launch
    Startup,
    /// Process running but never became healthy
    HealthCheck,
    /// Process exited after being healthy
    RuntimeCrash,
    /// Backing storage unavailable
    Volume,
    /// Stopped on request
    Cancelled,
    /// Anything else
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::Startup => write!(f, "startup"),
            ErrorKind::HealthCheck => write!(f, "health-check"),
            ErrorKind::RuntimeCrash => write!(f, "runtime-crash"),
            ErrorKind::Volume => write!(f, "volume"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

impl WardenError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            WardenError::Config(_)
            | WardenError::ConfigParse(_)
            | WardenError::CyclicDependency { .. }
            | WardenError::UnknownDependency { .. }
            | WardenError::ServiceNotFound(_) => ErrorKind::Configuration,
            WardenError::Startup(_) => ErrorKind::Startup,
            WardenError::HealthCheck(_) => ErrorKind::HealthCheck,
            WardenError::RuntimeCrash(_) => ErrorKind::RuntimeCrash,
            WardenError::Volume(_) | WardenError::VolumeNotFound(_) => ErrorKind::Volume,
            WardenError::Cancelled => ErrorKind::Cancelled,
            WardenError::Lock(_)
            | WardenError::Io(_)
            | WardenError::Json(_)
            | WardenError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Last error observed for a service, as shown in reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Error kind
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
}

impl From<&WardenError> for FailureRecord {
    fn from(err: &WardenError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}
