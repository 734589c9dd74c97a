//! Warden - a compose-style service supervisor
//!
//! Warden starts a project of local services in dependency order and keeps
//! them running. It provides:
//!
//! - Project files with services, health checks, and restart policies
//! - Dependency layers with a health barrier between them
//! - Per-service supervision with exponential backoff
//! - Named volumes shared between services and kept across runs

pub mod cancel;
pub mod compose;
pub mod error;
pub mod health;
pub mod runtime;
pub mod settings;
pub mod storage;
pub mod supervisor;

pub use error::{Result, WardenError};
