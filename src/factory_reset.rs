//! Wiping the device back to its factory image
//!
//! Every erase is read back. A region that does not read back blank, or that
//! cannot be erased because it is the one executing, stays in the pending set
//! in the KV store and is retried by [`FactoryReset::resume_pending`] on the
//! next boot.

use std::time::Duration;

use crate::error::LifecycleError;
use crate::platform::{FlashStore, SlotKind, System, ERASED_BYTE, SECTOR_SIZE};
use crate::state::{PendingErasureSet, PersistentStateStore, PostResetReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErasureOutcome {
    Completed,
    /// Still owed; carries the slot label
    Deferred(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EraseReport {
    pub network_restored: bool,
    /// Erased and read back blank
    pub erased: Vec<String>,
    /// Skipped because the code runs from it
    pub deferred: Vec<String>,
    /// Erase failed or did not read back blank
    pub failed: Vec<String>,
}

impl EraseReport {
    /// What the next boot still has to erase
    pub fn pending(&self) -> PendingErasureSet {
        let mut pending = PendingErasureSet::new();
        for label in self.deferred.iter().chain(&self.failed) {
            pending.insert(label.clone());
        }
        pending
    }

    pub fn is_clean(&self) -> bool {
        self.deferred.is_empty() && self.failed.is_empty()
    }
}

/// Whether every byte of `label` reads back as erased flash
pub fn verify_erased(flash: &dyn FlashStore, label: &str) -> Result<bool, LifecycleError> {
    let size = flash
        .slot(label)
        .ok_or_else(|| LifecycleError::SlotNotFound(label.to_string()))?
        .size;
    let mut buf = vec![0u8; SECTOR_SIZE as usize];
    let mut offset = 0u32;
    while offset < size {
        let n = (size - offset).min(SECTOR_SIZE);
        let chunk = &mut buf[..n as usize];
        flash
            .read(label, offset, chunk)
            .map_err(|e| LifecycleError::flash("read back", label, e))?;
        if let Some(at) = chunk.iter().position(|b| *b != ERASED_BYTE) {
            warn!(
                "factory_reset: {} not blank at offset 0x{:x}",
                label,
                offset + at as u32
            );
            return Ok(false);
        }
        offset += n;
    }
    Ok(true)
}

/// Single writer over flash and the KV store while a reset runs
pub struct FactoryReset<'a> {
    flash: &'a mut dyn FlashStore,
    state: &'a mut PersistentStateStore,
    system: &'a mut dyn System,
}

impl<'a> FactoryReset<'a> {
    pub fn new(
        flash: &'a mut dyn FlashStore,
        state: &'a mut PersistentStateStore,
        system: &'a mut dyn System,
    ) -> Self {
        Self {
            flash,
            state,
            system,
        }
    }

    /// One tick per second so the operator can see what is about to happen
    pub fn countdown(&mut self, secs: u32) {
        for remaining in (1..=secs).rev() {
            warn!("factory_reset: Erasing device in {}s", remaining);
            self.system.sleep(Duration::from_secs(1));
        }
    }

    /// Countdown, erase and restart into the factory image.
    ///
    /// Restarts even when the erase reported an error.
    pub fn run(&mut self, countdown_secs: u32) -> Result<EraseReport, LifecycleError> {
        self.countdown(countdown_secs);
        let report = self.erase_all();
        match &report {
            Ok(report) if report.is_clean() => info!("factory_reset: Complete, restarting into factory"),
            Ok(report) => warn!(
                "factory_reset: Restarting with {} region(s) still owed: {}",
                report.deferred.len() + report.failed.len(),
                report.pending().encode()
            ),
            Err(err) => error!("factory_reset: {}, restarting current image", err),
        }
        self.system.restart();
        report
    }

    /// The erase sequence proper: network defaults, KV region, boot pointer,
    /// then every OTA slot except the running one
    pub fn erase_all(&mut self) -> Result<EraseReport, LifecycleError> {
        let mut report = EraseReport::default();
        info!("factory_reset: Starting erase");

        match self.system.restore_network_defaults() {
            Ok(()) => report.network_restored = true,
            Err(err) => warn!("factory_reset: Could not restore network defaults: {:#}", err),
        }
        if let Err(err) = self.system.reset_pairing() {
            warn!("factory_reset: Could not clear pairings: {:#}", err);
        }

        self.erase_kv(&mut report);

        if self.flash.factory_slot().is_none() {
            return Err(LifecycleError::FactorySlotMissing);
        }

        let running = self
            .flash
            .running_slot()
            .map_err(|e| LifecycleError::flash("query running slot", "-", e))?;

        let targets: Vec<String> = self
            .flash
            .slots()
            .into_iter()
            .filter(|slot| slot.kind == SlotKind::BootPointer || slot.is_ota())
            .map(|slot| slot.label)
            .collect();
        for label in targets {
            if label == running {
                info!("factory_reset: {} is running, deferring its erase", label);
                report.deferred.push(label);
                continue;
            }
            if self.erase_slot(&label) {
                report.erased.push(label);
            } else {
                report.failed.push(label);
            }
        }

        let pending = report.pending();
        if let Err(err) = self.state.set_pending_erasure(&pending) {
            error!("factory_reset: Could not record pending erasures: {}", err);
        }
        if let Err(err) = self.state.set_post_reset_reason(PostResetReason::Factory) {
            warn!("factory_reset: Could not record post-reset reason: {}", err);
        }

        info!(
            "factory_reset: Erased {}, deferred {:?}, failed {:?}",
            report.erased.join(","),
            report.deferred,
            report.failed
        );
        Ok(report)
    }

    /// Finish erasures a previous reset could not do. Runs on every boot, once
    /// the restart counter has been flushed.
    pub fn resume_pending(&mut self) -> Result<Vec<(String, ErasureOutcome)>, LifecycleError> {
        let pending = self.state.pending_erasure()?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let running = self
            .flash
            .running_slot()
            .map_err(|e| LifecycleError::flash("query running slot", "-", e))?;
        let kv_label = self.state.region_label();
        info!("factory_reset: Resuming pending erasures: {}", pending.encode());

        let mut remaining = PendingErasureSet::new();
        let mut outcomes = Vec::new();
        // Erasing the KV region also wipes the stored pending set
        let mut kv_erased = false;
        for label in pending.labels() {
            if self.flash.slot(label).is_none() {
                warn!("factory_reset: Dropping unknown pending slot {}", label);
                continue;
            }
            if label == running {
                warn!("factory_reset: Still running from {}, postponing its erase", label);
                remaining.insert(label);
                outcomes.push((label.to_string(), ErasureOutcome::Deferred(label.to_string())));
                continue;
            }

            let erased = if kv_label.as_deref() == Some(label) {
                kv_erased = true;
                let mut report = EraseReport::default();
                self.erase_kv(&mut report);
                report.failed.is_empty()
            } else {
                self.erase_slot(label)
            };

            if erased {
                outcomes.push((label.to_string(), ErasureOutcome::Completed));
            } else {
                remaining.insert(label);
                outcomes.push((label.to_string(), ErasureOutcome::Deferred(label.to_string())));
            }
        }

        if kv_erased || remaining != pending {
            self.state.set_pending_erasure(&remaining)?;
        }
        Ok(outcomes)
    }

    fn erase_kv(&mut self, report: &mut EraseReport) {
        let label = self.state.region_label();
        if let Err(err) = self.state.erase_region() {
            error!("factory_reset: KV erase failed: {}", err);
            report.failed.extend(label);
            return;
        }
        let Some(label) = label else {
            return;
        };
        match verify_erased(&*self.flash, &label) {
            Ok(true) => report.erased.push(label),
            Ok(false) => {
                error!("factory_reset: {} did not read back blank", label);
                report.failed.push(label);
            }
            Err(err) => {
                error!("factory_reset: {}", err);
                report.failed.push(label);
            }
        }
    }

    fn erase_slot(&mut self, label: &str) -> bool {
        info!("factory_reset: Erasing {}", label);
        if let Err(err) = self.flash.erase_slot(label) {
            error!("factory_reset: Erase of {} failed: {:#}", label, err);
            return false;
        }
        match verify_erased(&*self.flash, label) {
            Ok(true) => true,
            Ok(false) => {
                error!("factory_reset: {} did not read back blank", label);
                false
            }
            Err(err) => {
                error!("factory_reset: {}", err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{ResetReason, SlotInfo};
    use crate::sim::image::build_image;
    use crate::sim::{MemFlash, MemKv, SimSystem};

    fn board(running: &str) -> (MemFlash, PersistentStateStore, SimSystem) {
        let flash = MemFlash::small();
        for (label, version) in [("factory", "1.0.0"), ("ota_0", "1.1.0"), ("ota_1", "1.2.0")] {
            flash.flash_image(label, &build_image(version, &[4; 1024])).unwrap();
        }
        let mut pointer = flash.clone();
        pointer.set_boot_slot(running).unwrap();
        flash.reboot().unwrap();

        let mut state = PersistentStateStore::new(Box::new(MemKv::new(flash.clone(), "nvs")));
        state.set_restart_count(10).unwrap();
        (flash, state, SimSystem::new(ResetReason::PowerOn, "1.2.0"))
    }

    #[test]
    fn test_countdown_ticks() {
        let (mut flash, mut state, mut system) = board("ota_1");
        FactoryReset::new(&mut flash, &mut state, &mut system).countdown(3);
        assert_eq!(system.snapshot().slept, vec![Duration::from_secs(1); 3]);
    }

    #[test]
    fn test_erase_defers_running_slot() {
        let (mut flash, mut state, mut system) = board("ota_1");
        let report = FactoryReset::new(&mut flash, &mut state, &mut system)
            .run(0)
            .unwrap();

        assert!(report.network_restored);
        assert_eq!(report.deferred, vec!["ota_1".to_string()]);
        assert!(report.failed.is_empty());
        assert!(flash.is_erased("otadata").unwrap());
        assert!(flash.is_erased("ota_0").unwrap());
        assert!(!flash.is_erased("ota_1").unwrap());
        assert!(flash.image_info("factory").unwrap().is_some());
        assert_eq!(system.restarts(), 1);

        let mut fresh = PersistentStateStore::new(Box::new(MemKv::new(flash.clone(), "nvs")));
        assert_eq!(fresh.restart_count().unwrap(), 0);
        assert!(fresh.pending_erasure().unwrap().contains("ota_1"));
        assert_eq!(fresh.take_post_reset_reason().unwrap(), Some(PostResetReason::Factory));
    }

    #[test]
    fn test_resume_after_moving_to_factory() {
        let (mut flash, mut state, mut system) = board("ota_1");
        FactoryReset::new(&mut flash, &mut state, &mut system)
            .erase_all()
            .unwrap();

        // Still on ota_1: postponed, nothing lost
        let mut state = PersistentStateStore::new(Box::new(MemKv::new(flash.clone(), "nvs")));
        let outcomes = FactoryReset::new(&mut flash, &mut state, &mut system)
            .resume_pending()
            .unwrap();
        assert_eq!(
            outcomes,
            vec![("ota_1".to_string(), ErasureOutcome::Deferred("ota_1".into()))]
        );

        assert_eq!(flash.reboot().unwrap(), "factory");
        let mut state = PersistentStateStore::new(Box::new(MemKv::new(flash.clone(), "nvs")));
        let outcomes = FactoryReset::new(&mut flash, &mut state, &mut system)
            .resume_pending()
            .unwrap();
        assert_eq!(outcomes, vec![("ota_1".to_string(), ErasureOutcome::Completed)]);
        assert!(flash.is_erased("ota_1").unwrap());
        assert!(state.pending_erasure().unwrap().is_empty());
    }

    #[test]
    fn test_failed_verification_is_retried() {
        let (mut flash, mut state, mut system) = board("factory");
        flash.stick_byte("ota_0", 0x800, 0x00).unwrap();

        let report = FactoryReset::new(&mut flash, &mut state, &mut system)
            .erase_all()
            .unwrap();
        assert_eq!(report.failed, vec!["ota_0".to_string()]);
        assert!(report.deferred.is_empty());
        assert!(flash.is_erased("ota_1").unwrap());

        flash.unstick_all();
        let mut state = PersistentStateStore::new(Box::new(MemKv::new(flash.clone(), "nvs")));
        let outcomes = FactoryReset::new(&mut flash, &mut state, &mut system)
            .resume_pending()
            .unwrap();
        assert_eq!(outcomes, vec![("ota_0".to_string(), ErasureOutcome::Completed)]);
        assert!(flash.is_erased("ota_0").unwrap());
    }

    #[test]
    fn test_kv_region_retry_keeps_pending_set() {
        let (mut flash, mut state, mut system) = board("factory");
        flash.stick_byte("nvs", 0x3FF0, 0x00).unwrap();
        flash.stick_byte("ota_0", 0x800, 0x00).unwrap();

        let report = FactoryReset::new(&mut flash, &mut state, &mut system)
            .erase_all()
            .unwrap();
        assert_eq!(report.failed, vec!["nvs".to_string(), "ota_0".to_string()]);

        // Both still stuck: the retry wipes the KV region again, so the set
        // has to be written back
        let mut state = PersistentStateStore::new(Box::new(MemKv::new(flash.clone(), "nvs")));
        let outcomes = FactoryReset::new(&mut flash, &mut state, &mut system)
            .resume_pending()
            .unwrap();
        assert_eq!(
            outcomes,
            vec![
                ("nvs".to_string(), ErasureOutcome::Deferred("nvs".into())),
                ("ota_0".to_string(), ErasureOutcome::Deferred("ota_0".into())),
            ]
        );
        let mut fresh = PersistentStateStore::new(Box::new(MemKv::new(flash.clone(), "nvs")));
        let pending = fresh.pending_erasure().unwrap();
        assert!(pending.contains("nvs"));
        assert!(pending.contains("ota_0"));

        flash.unstick_all();
        let mut state = PersistentStateStore::new(Box::new(MemKv::new(flash.clone(), "nvs")));
        let outcomes = FactoryReset::new(&mut flash, &mut state, &mut system)
            .resume_pending()
            .unwrap();
        assert_eq!(
            outcomes,
            vec![
                ("nvs".to_string(), ErasureOutcome::Completed),
                ("ota_0".to_string(), ErasureOutcome::Completed),
            ]
        );
        assert!(state.pending_erasure().unwrap().is_empty());
        assert!(flash.is_erased("ota_0").unwrap());
    }

    #[test]
    fn test_network_failure_does_not_abort() {
        let (mut flash, mut state, mut system) = board("factory");
        system.fail_network_restore(true);
        let report = FactoryReset::new(&mut flash, &mut state, &mut system)
            .erase_all()
            .unwrap();
        assert!(!report.network_restored);
        assert!(report.is_clean());
    }

    #[test]
    fn test_missing_factory_erases_kv_only() {
        let mut flash = MemFlash::new(vec![
            SlotInfo::new("nvs", SlotKind::KvStore, 0x4000),
            SlotInfo::new("otadata", SlotKind::BootPointer, 0x2000),
            SlotInfo::new("ota_0", SlotKind::Ota(0), 0x10000),
            SlotInfo::new("ota_1", SlotKind::Ota(1), 0x10000),
        ]);
        flash.flash_image("ota_1", &build_image("1.0.0", &[1; 64])).unwrap();
        let mut state = PersistentStateStore::new(Box::new(MemKv::new(flash.clone(), "nvs")));
        state.set_restart_count(11).unwrap();
        let mut system = SimSystem::new(ResetReason::PowerOn, "1.0.0");

        let err = FactoryReset::new(&mut flash, &mut state, &mut system)
            .run(0)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::FactorySlotMissing));
        assert!(flash.is_erased("nvs").unwrap());
        assert!(flash.image_info("ota_1").unwrap().is_some());
        assert_eq!(system.restarts(), 1);
    }
}
