use anyhow::{anyhow, Result};

/// Value every byte reads back as after an erase
pub const ERASED_BYTE: u8 = 0xFF;

/// Smallest erasable unit
pub const SECTOR_SIZE: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Originally flashed application, never erased
    Factory,
    /// Updatable application slot, `ota_<n>`
    Ota(u8),
    /// Record telling the bootloader which application to run next
    BootPointer,
    /// Backing region of the KV store
    KvStore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub label: String,
    pub kind: SlotKind,
    pub size: u32,
}

impl SlotInfo {
    pub fn new(label: impl Into<String>, kind: SlotKind, size: u32) -> Self {
        Self {
            label: label.into(),
            kind,
            size,
        }
    }

    pub fn is_application(&self) -> bool {
        matches!(self.kind, SlotKind::Factory | SlotKind::Ota(_))
    }

    pub fn is_ota(&self) -> bool {
        matches!(self.kind, SlotKind::Ota(_))
    }
}

/// Metadata the platform reads out of an application image in place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Version string embedded in the image, may be empty
    pub version: String,
    /// Length of the image in bytes as recorded by its own headers
    pub image_len: u32,
}

/// Raw access to the fixed partition table
pub trait FlashStore: Send {
    /// Every region in partition-table order
    fn slots(&self) -> Vec<SlotInfo>;

    fn read(&self, label: &str, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Writes can only clear bits; the range must have been erased first
    fn write(&mut self, label: &str, offset: u32, data: &[u8]) -> Result<()>;

    /// `offset` and `len` are multiples of [`SECTOR_SIZE`]
    fn erase_range(&mut self, label: &str, offset: u32, len: u32) -> Result<()>;

    /// `None` unless the slot holds a structurally valid application image
    fn image_info(&self, label: &str) -> Result<Option<ImageInfo>>;

    /// Application slot the current code executes from
    fn running_slot(&self) -> Result<String>;

    /// Application slot the bootloader will pick on the next restart
    fn boot_slot(&self) -> Result<String>;

    fn set_boot_slot(&mut self, label: &str) -> Result<()>;

    fn slot(&self, label: &str) -> Option<SlotInfo> {
        self.slots().into_iter().find(|slot| slot.label == label)
    }

    fn factory_slot(&self) -> Option<SlotInfo> {
        self.slots()
            .into_iter()
            .find(|slot| slot.kind == SlotKind::Factory)
    }

    fn ota_slots(&self) -> Vec<SlotInfo> {
        self.slots().into_iter().filter(SlotInfo::is_ota).collect()
    }

    fn erase_slot(&mut self, label: &str) -> Result<()> {
        let slot = self
            .slot(label)
            .ok_or_else(|| anyhow!("unknown slot {}", label))?;
        self.erase_range(label, 0, slot.size)
    }
}
