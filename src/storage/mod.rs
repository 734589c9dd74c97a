//! Storage management module
//!
//! Named volumes that outlive the services mounting them.

pub mod volume;

pub use volume::{Attachment, VolumeManager, VolumeRecord};
