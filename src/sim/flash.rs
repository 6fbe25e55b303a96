use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail, Result};

use crate::platform::esp_image;
use crate::platform::{FlashStore, ImageInfo, SlotInfo, SlotKind, ERASED_BYTE, SECTOR_SIZE};

const BOOT_RECORD_MAGIC: &[u8; 4] = b"BOOT";

/// Counters for asserting which operations actually touched the chip
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlashStats {
    pub writes: usize,
    pub erases: usize,
    pub boot_pointer_writes: usize,
}

struct Region {
    info: SlotInfo,
    bytes: Vec<u8>,
    /// Offsets that refuse to erase, for exercising read-back verification
    stuck: HashSet<u32>,
}

struct Chip {
    regions: Vec<Region>,
    running: String,
    stats: FlashStats,
}

impl Chip {
    fn region(&self, label: &str) -> Result<&Region> {
        self.regions
            .iter()
            .find(|region| region.info.label == label)
            .ok_or_else(|| anyhow!("no partition labelled {}", label))
    }

    fn region_mut(&mut self, label: &str) -> Result<&mut Region> {
        self.regions
            .iter_mut()
            .find(|region| region.info.label == label)
            .ok_or_else(|| anyhow!("no partition labelled {}", label))
    }

    fn boot_pointer_label(&self) -> Option<String> {
        self.regions
            .iter()
            .find(|region| region.info.kind == SlotKind::BootPointer)
            .map(|region| region.info.label.clone())
    }

    fn erase(&mut self, label: &str, offset: u32, len: u32) -> Result<()> {
        if offset % SECTOR_SIZE != 0 || len % SECTOR_SIZE != 0 {
            bail!("erase of {}+{} on {} is not sector aligned", offset, len, label);
        }
        let region = self.region_mut(label)?;
        let end = checked_end(offset, len, region.info.size)?;
        for at in offset..end {
            if !region.stuck.contains(&at) {
                region.bytes[at as usize] = ERASED_BYTE;
            }
        }
        self.stats.erases += 1;
        Ok(())
    }

    fn program(&mut self, label: &str, offset: u32, data: &[u8]) -> Result<()> {
        let region = self.region_mut(label)?;
        let end = checked_end(offset, data.len() as u32, region.info.size)?;
        for (dst, src) in region.bytes[offset as usize..end as usize]
            .iter_mut()
            .zip(data)
        {
            // NOR flash can only clear bits
            *dst &= *src;
        }
        self.stats.writes += 1;
        Ok(())
    }

    fn image_info(&self, label: &str) -> Result<Option<ImageInfo>> {
        let region = self.region(label)?;
        if !region.info.is_application() {
            return Ok(None);
        }
        esp_image::read_image_info(region.info.size, |offset, buf| {
            let start = offset as usize;
            let end = start + buf.len();
            let src = region
                .bytes
                .get(start..end)
                .ok_or_else(|| anyhow!("read past end of {}", label))?;
            buf.copy_from_slice(src);
            Ok(())
        })
    }
}

fn checked_end(offset: u32, len: u32, size: u32) -> Result<u32> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(end),
        _ => bail!("range {}+{} exceeds partition of {} bytes", offset, len, size),
    }
}

/// In-memory partition table with NOR write semantics.
///
/// Cloning gives another handle onto the same chip, which is how the KV
/// simulator and the tests see what the core wrote.
#[derive(Clone)]
pub struct MemFlash {
    chip: Arc<Mutex<Chip>>,
}

impl MemFlash {
    /// Every region starts erased. Runs from the factory slot if there is one.
    pub fn new(slots: Vec<SlotInfo>) -> Self {
        let running = slots
            .iter()
            .find(|slot| slot.kind == SlotKind::Factory)
            .or_else(|| slots.iter().find(|slot| slot.is_application()))
            .map(|slot| slot.label.clone())
            .unwrap_or_default();

        let regions = slots
            .into_iter()
            .map(|info| Region {
                bytes: vec![ERASED_BYTE; info.size as usize],
                info,
                stuck: HashSet::new(),
            })
            .collect();

        Self {
            chip: Arc::new(Mutex::new(Chip {
                regions,
                running,
                stats: FlashStats::default(),
            })),
        }
    }

    /// Small table for tests: 16 KiB KV, 8 KiB boot pointer, three 64 KiB apps
    pub fn small() -> Self {
        Self::new(vec![
            SlotInfo::new("nvs", SlotKind::KvStore, 0x4000),
            SlotInfo::new("otadata", SlotKind::BootPointer, 0x2000),
            SlotInfo::new("factory", SlotKind::Factory, 0x10000),
            SlotInfo::new("ota_0", SlotKind::Ota(0), 0x10000),
            SlotInfo::new("ota_1", SlotKind::Ota(1), 0x10000),
        ])
    }

    /// Sizes of a typical 4 MB two-OTA partition table
    pub fn esp32_4mb() -> Self {
        Self::new(vec![
            SlotInfo::new("nvs", SlotKind::KvStore, 0x6000),
            SlotInfo::new("otadata", SlotKind::BootPointer, 0x2000),
            SlotInfo::new("factory", SlotKind::Factory, 0x100000),
            SlotInfo::new("ota_0", SlotKind::Ota(0), 0x140000),
            SlotInfo::new("ota_1", SlotKind::Ota(1), 0x140000),
        ])
    }

    fn chip(&self) -> MutexGuard<'_, Chip> {
        self.chip.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Program a slot directly, as a serial flasher would
    pub fn flash_image(&self, label: &str, image: &[u8]) -> Result<()> {
        let mut chip = self.chip();
        let size = chip.region(label)?.info.size;
        chip.erase(label, 0, size)?;
        chip.program(label, 0, image)
    }

    pub fn set_running(&self, label: &str) {
        self.chip().running = label.to_string();
    }

    /// What the bootloader does on restart: run whatever the boot pointer says
    pub fn reboot(&self) -> Result<String> {
        let next = self.boot_slot()?;
        self.chip().running = next.clone();
        Ok(next)
    }

    pub fn contents(&self, label: &str) -> Result<Vec<u8>> {
        Ok(self.chip().region(label)?.bytes.clone())
    }

    pub fn is_erased(&self, label: &str) -> Result<bool> {
        Ok(self
            .chip()
            .region(label)?
            .bytes
            .iter()
            .all(|&b| b == ERASED_BYTE))
    }

    pub fn stick_byte(&self, label: &str, offset: u32, value: u8) -> Result<()> {
        let mut chip = self.chip();
        let region = chip.region_mut(label)?;
        region.stuck.insert(offset);
        region.bytes[offset as usize] = value;
        Ok(())
    }

    pub fn unstick_all(&self) {
        for region in self.chip().regions.iter_mut() {
            region.stuck.clear();
        }
    }

    pub fn stats(&self) -> FlashStats {
        self.chip().stats.clone()
    }
}

impl FlashStore for MemFlash {
    fn slots(&self) -> Vec<SlotInfo> {
        self.chip()
            .regions
            .iter()
            .map(|region| region.info.clone())
            .collect()
    }

    fn read(&self, label: &str, offset: u32, buf: &mut [u8]) -> Result<()> {
        let chip = self.chip();
        let region = chip.region(label)?;
        let end = checked_end(offset, buf.len() as u32, region.info.size)?;
        buf.copy_from_slice(&region.bytes[offset as usize..end as usize]);
        Ok(())
    }

    fn write(&mut self, label: &str, offset: u32, data: &[u8]) -> Result<()> {
        self.chip().program(label, offset, data)
    }

    fn erase_range(&mut self, label: &str, offset: u32, len: u32) -> Result<()> {
        self.chip().erase(label, offset, len)
    }

    fn image_info(&self, label: &str) -> Result<Option<ImageInfo>> {
        self.chip().image_info(label)
    }

    fn running_slot(&self) -> Result<String> {
        Ok(self.chip().running.clone())
    }

    fn boot_slot(&self) -> Result<String> {
        let chip = self.chip();
        if let Some(pointer) = chip.boot_pointer_label() {
            let bytes = &chip.region(&pointer)?.bytes;
            if bytes.len() > 5 && &bytes[..4] == BOOT_RECORD_MAGIC {
                let len = bytes[4] as usize;
                if let Some(raw) = bytes.get(5..5 + len) {
                    let label = String::from_utf8_lossy(raw).into_owned();
                    if chip.region(&label).is_ok() {
                        return Ok(label);
                    }
                }
            }
        }

        // Blank or unreadable pointer: factory, else the first OTA slot
        chip.regions
            .iter()
            .find(|region| region.info.kind == SlotKind::Factory)
            .or_else(|| chip.regions.iter().find(|region| region.info.is_ota()))
            .map(|region| region.info.label.clone())
            .ok_or_else(|| anyhow!("partition table has no application slot"))
    }

    fn set_boot_slot(&mut self, label: &str) -> Result<()> {
        let mut chip = self.chip();
        let target = chip.region(label)?.info.clone();
        if !target.is_application() {
            bail!("{} is not an application partition", label);
        }
        if target.is_ota() && chip.image_info(label)?.is_none() {
            bail!("{} does not hold a valid image", label);
        }
        let pointer = chip
            .boot_pointer_label()
            .ok_or_else(|| anyhow!("partition table has no boot pointer"))?;

        let size = chip.region(&pointer)?.info.size;
        chip.erase(&pointer, 0, size)?;
        if target.is_ota() {
            let mut record = BOOT_RECORD_MAGIC.to_vec();
            record.push(label.len() as u8);
            record.extend_from_slice(label.as_bytes());
            chip.program(&pointer, 0, &record)?;
        }
        chip.stats.boot_pointer_writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::image::build_image;

    #[test]
    fn test_writes_only_clear_bits() {
        let mut flash = MemFlash::small();
        flash.write("ota_0", 0, &[0x0F]).unwrap();
        flash.write("ota_0", 0, &[0xF0]).unwrap();

        let mut buf = [0u8; 1];
        flash.read("ota_0", 0, &mut buf).unwrap();
        assert_eq!(buf, [0x00]);
    }

    #[test]
    fn test_unaligned_erase_rejected() {
        let mut flash = MemFlash::small();
        assert!(flash.erase_range("ota_0", 100, SECTOR_SIZE).is_err());
        assert!(flash.erase_range("ota_0", 0, 0x20000).is_err());
    }

    #[test]
    fn test_boot_pointer_follows_set_boot_slot() {
        let mut flash = MemFlash::small();
        assert_eq!(flash.boot_slot().unwrap(), "factory");

        assert!(flash.set_boot_slot("ota_1").is_err(), "empty slot must not boot");

        flash.flash_image("ota_1", &build_image("1.0.0", &[7; 100])).unwrap();
        flash.set_boot_slot("ota_1").unwrap();
        assert_eq!(flash.boot_slot().unwrap(), "ota_1");
        assert_eq!(flash.reboot().unwrap(), "ota_1");
        assert_eq!(flash.running_slot().unwrap(), "ota_1");

        flash.set_boot_slot("factory").unwrap();
        assert!(flash.is_erased("otadata").unwrap());
        assert_eq!(flash.boot_slot().unwrap(), "factory");
    }

    #[test]
    fn test_stuck_byte_survives_erase() {
        let mut flash = MemFlash::small();
        flash.stick_byte("ota_0", 10, 0x00).unwrap();
        flash.erase_slot("ota_0").unwrap();
        assert!(!flash.is_erased("ota_0").unwrap());

        flash.unstick_all();
        flash.erase_slot("ota_0").unwrap();
        assert!(flash.is_erased("ota_0").unwrap());
    }
}
