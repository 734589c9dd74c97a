//! Service supervision
//!
//! One tokio task per service instance drives it through
//! `Pending -> Starting -> HealthChecking -> Healthy` and applies the
//! restart policy whenever it fails.

pub mod backoff;
pub mod service;
pub mod state;

pub use backoff::BackoffPolicy;
pub use service::{ServiceSupervisor, SupervisorContext, SupervisorHandle};
pub use state::{InstanceStatus, LifecycleEvent, ServiceState};
