//! `FlashStore` over the ESP-IDF partition API

use std::ffi::{c_void, CStr};

use anyhow::{anyhow, bail, Context, Result};
use esp_idf_sys::{self as sys, esp};
use log::info;

use esp32_lifecycle::platform::esp_image::read_image_info;
use esp32_lifecycle::platform::{FlashStore, ImageInfo, SlotInfo, SlotKind};

/// Entries of the partition table live in rodata for the life of the program
#[derive(Clone, Copy)]
struct Partition(*const sys::esp_partition_t);

unsafe impl Send for Partition {}

impl Partition {
    fn label(&self) -> String {
        unsafe { CStr::from_ptr((*self.0).label.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

pub struct EspPartitions {
    table: Vec<(SlotInfo, Partition)>,
}

fn kind_of(part: &sys::esp_partition_t) -> Option<SlotKind> {
    let ota_min = sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MIN;
    let ota_max = sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MAX;

    if part.type_ == sys::esp_partition_type_t_ESP_PARTITION_TYPE_APP {
        if part.subtype == sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_FACTORY {
            return Some(SlotKind::Factory);
        }
        if (ota_min..ota_max).contains(&part.subtype) {
            return Some(SlotKind::Ota((part.subtype - ota_min) as u8));
        }
        return None;
    }
    if part.type_ != sys::esp_partition_type_t_ESP_PARTITION_TYPE_DATA {
        return None;
    }
    match part.subtype {
        s if s == sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_DATA_OTA => Some(SlotKind::BootPointer),
        s if s == sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_DATA_NVS => Some(SlotKind::KvStore),
        _ => None,
    }
}

impl EspPartitions {
    /// Reads the partition table once. Partitions the core has no use for
    /// (phy_init, coredump, spiffs) are left out.
    pub fn new() -> Result<Self> {
        let mut table = Vec::new();
        unsafe {
            let mut it = sys::esp_partition_find(
                sys::esp_partition_type_t_ESP_PARTITION_TYPE_ANY,
                sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
                std::ptr::null(),
            );
            while !it.is_null() {
                let part = Partition(sys::esp_partition_get(it));
                if let Some(kind) = kind_of(&*part.0) {
                    let info = SlotInfo::new(part.label(), kind, (*part.0).size);
                    info!("partitions: {} {:?} at 0x{:x}, {} bytes", info.label, kind, (*part.0).address, info.size);
                    table.push((info, part));
                }
                it = sys::esp_partition_next(it);
            }
            sys::esp_partition_iterator_release(it);
        }

        if table.is_empty() {
            bail!("partition table is empty");
        }
        Ok(Self { table })
    }

    fn find(&self, label: &str) -> Result<Partition> {
        self.table
            .iter()
            .find(|(info, _)| info.label == label)
            .map(|(_, part)| *part)
            .ok_or_else(|| anyhow!("no partition labelled {}", label))
    }

    fn label_of(&self, part: *const sys::esp_partition_t) -> Result<String> {
        if part.is_null() {
            bail!("ESP-IDF returned no partition");
        }
        Ok(Partition(part).label())
    }
}

impl FlashStore for EspPartitions {
    fn slots(&self) -> Vec<SlotInfo> {
        self.table.iter().map(|(info, _)| info.clone()).collect()
    }

    fn read(&self, label: &str, offset: u32, buf: &mut [u8]) -> Result<()> {
        let part = self.find(label)?;
        esp!(unsafe {
            sys::esp_partition_read(part.0, offset as usize, buf.as_mut_ptr() as *mut c_void, buf.len())
        })
        .with_context(|| format!("read {} bytes of {} at 0x{:x}", buf.len(), label, offset))
    }

    fn write(&mut self, label: &str, offset: u32, data: &[u8]) -> Result<()> {
        let part = self.find(label)?;
        esp!(unsafe {
            sys::esp_partition_write(part.0, offset as usize, data.as_ptr() as *const c_void, data.len())
        })
        .with_context(|| format!("write {} bytes of {} at 0x{:x}", data.len(), label, offset))
    }

    fn erase_range(&mut self, label: &str, offset: u32, len: u32) -> Result<()> {
        let part = self.find(label)?;
        esp!(unsafe { sys::esp_partition_erase_range(part.0, offset as usize, len as usize) })
            .with_context(|| format!("erase {} bytes of {} at 0x{:x}", len, label, offset))
    }

    fn image_info(&self, label: &str) -> Result<Option<ImageInfo>> {
        let size = self
            .slot(label)
            .ok_or_else(|| anyhow!("no partition labelled {}", label))?
            .size;
        read_image_info(size, |offset, buf| self.read(label, offset, buf))
    }

    fn running_slot(&self) -> Result<String> {
        self.label_of(unsafe { sys::esp_ota_get_running_partition() })
    }

    fn boot_slot(&self) -> Result<String> {
        self.label_of(unsafe { sys::esp_ota_get_boot_partition() })
    }

    fn set_boot_slot(&mut self, label: &str) -> Result<()> {
        let part = self.find(label)?;
        esp!(unsafe { sys::esp_ota_set_boot_partition(part.0) })
            .with_context(|| format!("set boot partition to {}", label))
    }
}
