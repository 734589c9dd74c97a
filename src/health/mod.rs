//! Readiness checking for service instances

pub mod checker;

pub use checker::{HealthChecker, HealthResult};
