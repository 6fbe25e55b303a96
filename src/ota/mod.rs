//! Firmware transfer and verification
//!
//! [`UpdatePipeline`] resolves a release, streams it into a free slot through a
//! [`SlotWriteGuard`], verifies it against the signature record and only then
//! points the bootloader at it.

pub mod download;
pub mod pipeline;
pub mod verify;
pub mod writer;

pub use download::Downloader;
pub use pipeline::UpdatePipeline;
pub use verify::{slot_digest, verify_slot};
pub use writer::SlotWriteGuard;

use crate::slots::BootSlotChange;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Remote release is not newer and nothing was requested
    UpToDate,
    /// Remote release is not newer; the boot pointer was aimed back at the
    /// installed image because an update had been requested
    Reactivated {
        slot: String,
        change: BootSlotChange,
        restart: bool,
    },
    /// A new image was written, verified and made the boot target
    Installed { version: String, slot: String },
}

impl UpdateOutcome {
    pub fn requires_restart(&self) -> bool {
        match self {
            UpdateOutcome::UpToDate => false,
            UpdateOutcome::Reactivated { restart, .. } => *restart,
            UpdateOutcome::Installed { .. } => true,
        }
    }
}
