//! In-memory platform: a partition table with NOR semantics, a KV store that
//! lives inside it, a scripted HTTP server and a recording system layer.
//!
//! Used by the unit tests, the `tests/` scenarios and the `lcm-sim` binary.

pub mod flash;
pub mod http;
pub mod image;
pub mod kv;
pub mod system;

pub use flash::{FlashStats, MemFlash};
pub use http::{CannedResponse, RecordedRequest, ScriptedHttp};
pub use kv::{KvFaults, MemKv};
pub use system::{SimState, SimSystem};

use crate::platform::ResetReason;
use crate::state::PersistentStateStore;
use crate::tasks::Device;

/// Every handle onto one simulated board.
///
/// The fields are clones sharing state with the trait objects inside the
/// [`Device`] built by [`SimBoard::device`], so tests can poke the hardware
/// while the core owns it.
#[derive(Clone)]
pub struct SimBoard {
    pub flash: MemFlash,
    pub http: ScriptedHttp,
    pub system: SimSystem,
    pub kv_label: String,
}

impl SimBoard {
    pub fn new(flash: MemFlash, reset_reason: ResetReason, running_version: &str) -> Self {
        Self {
            flash,
            http: ScriptedHttp::new(),
            system: SimSystem::new(reset_reason, running_version),
            kv_label: "nvs".to_string(),
        }
    }

    pub fn kv(&self) -> MemKv {
        MemKv::new(self.flash.clone(), &self.kv_label)
    }

    pub fn state(&self) -> PersistentStateStore {
        PersistentStateStore::new(Box::new(self.kv()))
    }

    pub fn device(&self) -> Device {
        Device {
            flash: Box::new(self.flash.clone()),
            state: self.state(),
            http: Box::new(self.http.clone()),
            system: Box::new(self.system.clone()),
        }
    }

    /// Let the bootloader pick the next slot and come back up for `reason`.
    /// The running version follows whatever image the new slot holds.
    pub fn power_cycle(&self, reason: ResetReason) -> anyhow::Result<String> {
        use crate::platform::FlashStore;

        let slot = self.flash.reboot()?;
        let version = self
            .flash
            .image_info(&slot)?
            .map(|image| image.version)
            .unwrap_or_default();
        self.system.set_reset_reason(reason);
        self.system.set_running_version(&version);
        Ok(slot)
    }
}
