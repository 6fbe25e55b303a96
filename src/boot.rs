//! What runs first on every boot, before the application proper

use crate::config::RestartConfig;
use crate::error::LifecycleError;
use crate::factory_reset::{ErasureOutcome, FactoryReset};
use crate::platform::{FlashStore, ResetReason, System};
use crate::restart::{BootDecision, RestartCounter};
use crate::state::{PersistentStateStore, PostResetReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootReport {
    pub reset_reason: ResetReason,
    pub running_slot: String,
    /// Pending erasures from an earlier factory reset, as resolved this boot
    pub erasures: Vec<(String, ErasureOutcome)>,
    pub decision: BootDecision,
    /// Why the lifecycle core restarted the device last time, if it did
    pub post_reset: Option<PostResetReason>,
}

/// Classify the reset and flush the restart count, then finish owed erasures.
///
/// The counter runs before anything else reads or writes the KV store. When a
/// pending erase of the KV region runs afterwards it wipes that count, so the
/// count is written back.
///
/// The caller acts on [`BootReport::decision`]: arm the stable-window timer
/// for `Counting`, start the factory reset worker for `ThresholdReached`.
pub fn run_boot_sequence(
    flash: &mut dyn FlashStore,
    state: &mut PersistentStateStore,
    system: &mut dyn System,
    config: &RestartConfig,
) -> Result<BootReport, LifecycleError> {
    let reset_reason = system.reset_reason();
    let running_slot = flash
        .running_slot()
        .map_err(|e| LifecycleError::flash("query running slot", "-", e))?;
    info!(
        "boot: Reset reason {}, running from {} ({})",
        reset_reason,
        running_slot,
        system.running_version()
    );

    let decision = RestartCounter::new(config).on_boot(state, reset_reason)?;

    let post_reset = state.take_post_reset_reason().unwrap_or_else(|err| {
        warn!("boot: Could not read post-reset reason: {}", err);
        None
    });
    if let Some(reason) = post_reset {
        info!("boot: Previous restart was for {}", reason);
    }

    let erasures = FactoryReset::new(&mut *flash, &mut *state, &mut *system)
        .resume_pending()
        .unwrap_or_else(|err| {
            error!("boot: Could not resume pending erasures: {}", err);
            Vec::new()
        });

    let kv_label = state.region_label();
    let kv_wiped = erasures
        .iter()
        .any(|(label, _)| kv_label.as_deref() == Some(label.as_str()));
    let count = match decision {
        BootDecision::Idle => 0,
        BootDecision::Counting { count, .. } | BootDecision::ThresholdReached { count } => count,
    };
    if kv_wiped && count > 0 {
        state.set_restart_count(count)?;
    }

    Ok(BootReport {
        reset_reason,
        running_slot,
        erasures,
        decision,
        post_reset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::image::build_image;
    use crate::sim::{MemFlash, MemKv, SimSystem};
    use crate::state::PendingErasureSet;

    #[test]
    fn test_software_reset_after_factory_reset() {
        let mut flash = MemFlash::small();
        flash.flash_image("factory", &build_image("1.0.0", &[0; 128])).unwrap();
        flash.flash_image("ota_0", &build_image("1.1.0", &[0; 128])).unwrap();

        let mut state = PersistentStateStore::new(Box::new(MemKv::new(flash.clone(), "nvs")));
        let mut pending = PendingErasureSet::new();
        pending.insert("ota_0");
        state.set_pending_erasure(&pending).unwrap();
        state.set_post_reset_reason(PostResetReason::Factory).unwrap();
        state.set_restart_count(4).unwrap();

        let mut state = PersistentStateStore::new(Box::new(MemKv::new(flash.clone(), "nvs")));
        let mut system = SimSystem::new(ResetReason::Software, "1.0.0");
        let report =
            run_boot_sequence(&mut flash, &mut state, &mut system, &RestartConfig::default()).unwrap();

        assert_eq!(report.running_slot, "factory");
        assert_eq!(report.erasures, vec![("ota_0".to_string(), ErasureOutcome::Completed)]);
        assert_eq!(report.decision, BootDecision::Idle);
        assert_eq!(report.post_reset, Some(PostResetReason::Factory));
        assert!(flash.is_erased("ota_0").unwrap());
        assert_eq!(state.restart_count().unwrap(), 0);
        assert_eq!(state.take_post_reset_reason().unwrap(), None);
    }

    #[test]
    fn test_count_survives_pending_kv_erase() {
        let mut flash = MemFlash::small();
        flash.flash_image("factory", &build_image("1.0.0", &[0; 128])).unwrap();

        let mut state = PersistentStateStore::new(Box::new(MemKv::new(flash.clone(), "nvs")));
        let mut pending = PendingErasureSet::new();
        pending.insert("nvs");
        state.set_pending_erasure(&pending).unwrap();
        state.set_restart_count(2).unwrap();

        let mut state = PersistentStateStore::new(Box::new(MemKv::new(flash.clone(), "nvs")));
        let mut system = SimSystem::new(ResetReason::PowerOn, "1.0.0");
        let report =
            run_boot_sequence(&mut flash, &mut state, &mut system, &RestartConfig::default()).unwrap();

        assert_eq!(report.erasures, vec![("nvs".to_string(), ErasureOutcome::Completed)]);
        assert!(matches!(report.decision, BootDecision::Counting { count: 3, .. }));

        let mut fresh = PersistentStateStore::new(Box::new(MemKv::new(flash.clone(), "nvs")));
        assert_eq!(fresh.restart_count().unwrap(), 3);
        assert!(fresh.pending_erasure().unwrap().is_empty());
    }
}
