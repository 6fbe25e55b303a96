//! Lifecycle state that survives reboots

pub mod store;
pub mod types;

pub use store::PersistentStateStore;
pub use types::{InstalledFirmwareRecord, PendingErasureSet, PostResetReason, UpdateSource};
