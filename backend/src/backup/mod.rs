//! C7: backup engine — scheduling, blob cache, manifest shape, retention,
//! and manifest import.

pub mod blob_cache;
pub mod engine;
pub mod import;
pub mod manifest;
pub mod retention;

pub use engine::{BackupEngine, InstanceDirectory, QueueError, RunProgress};
