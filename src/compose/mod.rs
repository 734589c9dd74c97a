//! Compose-style project orchestration
//!
//! A project file declares services with their start commands, health checks,
//! restart policies, and volumes. The orchestrator brings them up in dependency
//! layers and tears them down in reverse.

pub mod config;
pub mod duration;
pub mod orchestrator;
pub mod parser;
pub mod report;
pub mod resolver;

pub use config::{
    BackoffSpec, CommandSpec, HealthCheckSpec, ProjectConfig, RestartPolicy, ServiceSpec,
    VolumeMountSpec,
};
pub use orchestrator::{Orchestrator, OrchestratorOptions};
pub use parser::ProjectParser;
pub use report::{DeploymentOutcome, DeploymentReport, ServiceReport};
pub use resolver::DependencyGraph;
