//! Which slot runs, which slot boots next, and which slot holds what

use common::VersionTriple;

use crate::error::LifecycleError;
use crate::platform::{FlashStore, SlotInfo};
use crate::state::{InstalledFirmwareRecord, PersistentStateStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootSlotChange {
    Changed { previous: String },
    Unchanged,
}

impl BootSlotChange {
    pub fn changed(&self) -> bool {
        matches!(self, BootSlotChange::Changed { .. })
    }
}

pub struct SlotManager<'a> {
    flash: &'a mut dyn FlashStore,
}

impl<'a> SlotManager<'a> {
    pub fn new(flash: &'a mut dyn FlashStore) -> Self {
        Self { flash }
    }

    pub fn running_slot(&self) -> Result<String, LifecycleError> {
        self.flash
            .running_slot()
            .map_err(|e| LifecycleError::flash("query running slot", "-", e))
    }

    pub fn boot_slot(&self) -> Result<String, LifecycleError> {
        self.flash
            .boot_slot()
            .map_err(|e| LifecycleError::flash("query boot slot", "-", e))
    }

    /// Pick the OTA slot the next download goes into.
    ///
    /// Walks the OTA slots starting after the running one and never returns
    /// the running slot. Slots the bootloader would pick next or that hold the
    /// recorded installed image are only used when nothing else is left.
    pub fn select_next_free_slot(
        &self,
        installed: Option<&InstalledFirmwareRecord>,
    ) -> Result<SlotInfo, LifecycleError> {
        let running = self.running_slot()?;
        let boot = self.boot_slot().ok();
        let ota = self.flash.ota_slots();

        let start = ota
            .iter()
            .position(|slot| slot.label == running)
            .map(|index| index + 1)
            .unwrap_or(0);
        let candidates: Vec<&SlotInfo> = ota
            .iter()
            .cycle()
            .skip(start)
            .take(ota.len())
            .filter(|slot| slot.label != running)
            .collect();

        let busy = |slot: &SlotInfo| {
            boot.as_deref() == Some(slot.label.as_str())
                || installed.map(|record| record.slot_label.as_str()) == Some(slot.label.as_str())
        };

        candidates
            .iter()
            .find(|slot| !busy(**slot))
            .or_else(|| candidates.first())
            .map(|slot| (*slot).clone())
            .ok_or(LifecycleError::NoFreeSlot { running })
    }

    /// Point the bootloader at `label`. Writes nothing when it already does.
    pub fn set_boot_slot(&mut self, label: &str) -> Result<BootSlotChange, LifecycleError> {
        let target = self
            .flash
            .slot(label)
            .filter(SlotInfo::is_application)
            .ok_or_else(|| LifecycleError::SlotNotFound(label.to_string()))?;

        let current = self.boot_slot()?;
        if current == target.label {
            debug!("slots: Boot slot already {}", label);
            return Ok(BootSlotChange::Unchanged);
        }

        self.flash
            .set_boot_slot(label)
            .map_err(|e| LifecycleError::flash("set boot slot", label, e))?;
        info!("slots: Boot slot changed {} -> {}", current, label);
        Ok(BootSlotChange::Changed { previous: current })
    }

    /// First application slot whose embedded version equals `version`,
    /// OTA slots before the factory slot
    pub fn find_slot_for_version(
        &self,
        version: &VersionTriple,
    ) -> Result<Option<SlotInfo>, LifecycleError> {
        if !version.is_valid() {
            return Ok(None);
        }

        let mut apps: Vec<SlotInfo> = self
            .flash
            .slots()
            .into_iter()
            .filter(SlotInfo::is_application)
            .collect();
        apps.sort_by_key(|slot| !slot.is_ota());

        for slot in apps {
            match self.flash.image_info(&slot.label) {
                Ok(Some(image)) if VersionTriple::parse(&image.version) == *version => {
                    return Ok(Some(slot));
                }
                Ok(_) => {}
                Err(err) => warn!("slots: Could not read image metadata of {}: {:#}", slot.label, err),
            }
        }
        Ok(None)
    }

    /// Slot holding the recorded installed image: the recorded label when it
    /// still holds a matching image, otherwise a scan by version
    pub fn locate_installed(
        &self,
        record: &InstalledFirmwareRecord,
    ) -> Result<SlotInfo, LifecycleError> {
        let wanted = VersionTriple::parse(&record.version);

        if let Some(slot) = self.flash.slot(&record.slot_label).filter(SlotInfo::is_application) {
            let image = self
                .flash
                .image_info(&slot.label)
                .map_err(|e| LifecycleError::flash("read image metadata", &slot.label, e))?;
            if let Some(image) = image {
                let embedded = VersionTriple::parse(&image.version);
                if !embedded.is_valid() || !wanted.is_valid() || embedded == wanted {
                    return Ok(slot);
                }
                warn!(
                    "slots: {} holds {} but record says {}",
                    slot.label, image.version, record.version
                );
            }
        }

        self.find_slot_for_version(&wanted)?.ok_or_else(|| {
            if wanted.is_valid() {
                LifecycleError::VersionNotFound(wanted)
            } else {
                LifecycleError::SlotNotFound(record.slot_label.clone())
            }
        })
    }

    /// Write-if-changed update of the installed record
    pub fn record_installed(
        state: &mut PersistentStateStore,
        version: &str,
        slot_label: &str,
    ) -> Result<bool, LifecycleError> {
        state.record_installed(&InstalledFirmwareRecord::new(version, slot_label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::image::build_image;
    use crate::sim::MemFlash;

    fn flash_with(images: &[(&str, &str)]) -> MemFlash {
        let flash = MemFlash::small();
        for (label, version) in images {
            flash.flash_image(label, &build_image(version, &[1; 512])).unwrap();
        }
        flash
    }

    #[test]
    fn test_next_slot_never_running() {
        let mut flash = flash_with(&[("factory", "0.1.0"), ("ota_0", "1.0.0")]);

        flash.set_running("ota_0");
        let slots = SlotManager::new(&mut flash);
        assert_eq!(slots.select_next_free_slot(None).unwrap().label, "ota_1");

        flash.set_running("ota_1");
        let slots = SlotManager::new(&mut flash);
        assert_eq!(slots.select_next_free_slot(None).unwrap().label, "ota_0");
    }

    #[test]
    fn test_next_slot_from_factory_avoids_installed() {
        let mut flash = flash_with(&[("factory", "0.1.0"), ("ota_0", "1.0.0")]);
        let installed = InstalledFirmwareRecord::new("1.0.0", "ota_0");

        let slots = SlotManager::new(&mut flash);
        assert_eq!(slots.select_next_free_slot(Some(&installed)).unwrap().label, "ota_1");
        assert_eq!(slots.select_next_free_slot(None).unwrap().label, "ota_0");
    }

    #[test]
    fn test_single_ota_slot_running_has_no_free_slot() {
        let mut flash = MemFlash::new(vec![
            SlotInfo::new("otadata", crate::platform::SlotKind::BootPointer, 0x2000),
            SlotInfo::new("ota_0", crate::platform::SlotKind::Ota(0), 0x10000),
        ]);
        let slots = SlotManager::new(&mut flash);
        assert!(matches!(
            slots.select_next_free_slot(None),
            Err(LifecycleError::NoFreeSlot { .. })
        ));
    }

    #[test]
    fn test_set_boot_slot_is_idempotent() {
        let mut flash = flash_with(&[("ota_1", "1.2.0")]);
        let mut slots = SlotManager::new(&mut flash);

        assert_eq!(
            slots.set_boot_slot("ota_1").unwrap(),
            BootSlotChange::Changed {
                previous: "factory".into()
            }
        );

        let before = flash.contents("otadata").unwrap();
        let stats = flash.stats();
        let mut slots = SlotManager::new(&mut flash);
        assert_eq!(slots.set_boot_slot("ota_1").unwrap(), BootSlotChange::Unchanged);
        assert_eq!(flash.contents("otadata").unwrap(), before);
        assert_eq!(flash.stats(), stats);
    }

    #[test]
    fn test_set_boot_slot_unknown_or_data() {
        let mut flash = MemFlash::small();
        let mut slots = SlotManager::new(&mut flash);
        assert!(matches!(
            slots.set_boot_slot("ota_9"),
            Err(LifecycleError::SlotNotFound(_))
        ));
        assert!(matches!(
            slots.set_boot_slot("nvs"),
            Err(LifecycleError::SlotNotFound(_))
        ));
    }

    #[test]
    fn test_find_slot_for_version() {
        let mut flash = flash_with(&[("factory", "1.0.0"), ("ota_0", "1.1.0"), ("ota_1", "1.0.0")]);
        let slots = SlotManager::new(&mut flash);

        let found = slots
            .find_slot_for_version(&VersionTriple::new(1, 0, 0))
            .unwrap();
        assert_eq!(found.unwrap().label, "ota_1");
        assert!(slots
            .find_slot_for_version(&VersionTriple::new(2, 0, 0))
            .unwrap()
            .is_none());
        assert!(slots
            .find_slot_for_version(&VersionTriple::INVALID)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_locate_installed_falls_back_to_scan() {
        let mut flash = flash_with(&[("ota_0", "1.2.0")]);
        let slots = SlotManager::new(&mut flash);

        let stale = InstalledFirmwareRecord::new("1.2.0", "ota_1");
        assert_eq!(slots.locate_installed(&stale).unwrap().label, "ota_0");

        let exact = InstalledFirmwareRecord::new("1.2.0", "ota_0");
        assert_eq!(slots.locate_installed(&exact).unwrap().label, "ota_0");

        let missing = InstalledFirmwareRecord::new("3.0.0", "ota_1");
        assert!(matches!(
            slots.locate_installed(&missing),
            Err(LifecycleError::VersionNotFound(_))
        ));
    }

    #[test]
    fn test_record_installed_only_writes_changes() {
        let flash = MemFlash::small();
        let mut state = PersistentStateStore::new(Box::new(crate::sim::MemKv::new(flash.clone(), "nvs")));

        assert!(SlotManager::record_installed(&mut state, "1.2.0", "ota_0").unwrap());
        let writes = flash.stats();
        assert!(!SlotManager::record_installed(&mut state, "1.2.0", "ota_0").unwrap());
        assert_eq!(flash.stats(), writes);
        assert!(SlotManager::record_installed(&mut state, "1.3.0", "ota_1").unwrap());
        assert_eq!(
            state.installed_firmware().unwrap(),
            Some(InstalledFirmwareRecord::new("1.3.0", "ota_1"))
        );
    }
}
