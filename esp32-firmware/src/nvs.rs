//! `KvStore` on the default NVS partition through the raw `nvs_*` calls

use std::collections::BTreeMap;
use std::ffi::{c_char, CString};

use anyhow::{anyhow, bail, Context, Result};
use esp_idf_sys::{self as sys, esp};
use log::{debug, warn};

use esp32_lifecycle::platform::{KvStore, KvValue, OpenStatus};

pub const NVS_LABEL: &str = "nvs";

fn cstr(s: &str) -> Result<CString> {
    CString::new(s).with_context(|| format!("{:?} contains a NUL byte", s))
}

/// Handles are opened per namespace on first write and kept until the region
/// is erased
pub struct EspKv {
    initialised: bool,
    handles: BTreeMap<String, sys::nvs_handle_t>,
}

impl EspKv {
    pub fn new() -> Self {
        Self {
            initialised: false,
            handles: BTreeMap::new(),
        }
    }

    fn writable(&mut self, namespace: &str) -> Result<sys::nvs_handle_t> {
        if !self.initialised {
            bail!("nvs is not open");
        }
        if let Some(handle) = self.handles.get(namespace) {
            return Ok(*handle);
        }
        let name = cstr(namespace)?;
        let mut handle: sys::nvs_handle_t = 0;
        esp!(unsafe { sys::nvs_open(name.as_ptr(), sys::nvs_open_mode_t_NVS_READWRITE, &mut handle) })
            .with_context(|| format!("nvs_open({})", namespace))?;
        self.handles.insert(namespace.to_string(), handle);
        Ok(handle)
    }

    fn close_all(&mut self) {
        for (_, handle) in std::mem::take(&mut self.handles) {
            unsafe { sys::nvs_close(handle) };
        }
    }
}

impl Default for EspKv {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EspKv {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Read-only view of one namespace for a single lookup
struct Reader(sys::nvs_handle_t);

impl Reader {
    /// `None` when the namespace has never been written
    fn open(namespace: &str) -> Result<Option<Self>> {
        let name = cstr(namespace)?;
        let mut handle: sys::nvs_handle_t = 0;
        let err = unsafe { sys::nvs_open(name.as_ptr(), sys::nvs_open_mode_t_NVS_READONLY, &mut handle) };
        if err == sys::ESP_ERR_NVS_NOT_FOUND as sys::esp_err_t {
            return Ok(None);
        }
        esp!(err).with_context(|| format!("nvs_open({}, readonly)", namespace))?;
        Ok(Some(Self(handle)))
    }

    fn get(&self, key: &CString) -> Result<Option<KvValue>> {
        let mut kind: sys::nvs_type_t = 0;
        let err = unsafe { sys::nvs_find_key(self.0, key.as_ptr(), &mut kind) };
        if err == sys::ESP_ERR_NVS_NOT_FOUND as sys::esp_err_t {
            return Ok(None);
        }
        esp!(err).context("nvs_find_key")?;

        let value = match kind {
            sys::nvs_type_t_NVS_TYPE_U8 => {
                let mut value = 0u8;
                esp!(unsafe { sys::nvs_get_u8(self.0, key.as_ptr(), &mut value) }).context("nvs_get_u8")?;
                KvValue::U8(value)
            }
            sys::nvs_type_t_NVS_TYPE_U32 => {
                let mut value = 0u32;
                esp!(unsafe { sys::nvs_get_u32(self.0, key.as_ptr(), &mut value) }).context("nvs_get_u32")?;
                KvValue::U32(value)
            }
            sys::nvs_type_t_NVS_TYPE_STR => {
                let mut len = 0usize;
                esp!(unsafe { sys::nvs_get_str(self.0, key.as_ptr(), std::ptr::null_mut(), &mut len) })
                    .context("nvs_get_str length")?;
                let mut buf = vec![0u8; len];
                esp!(unsafe {
                    sys::nvs_get_str(self.0, key.as_ptr(), buf.as_mut_ptr() as *mut c_char, &mut len)
                })
                .context("nvs_get_str")?;
                if let Some(nul) = buf.iter().position(|b| *b == 0) {
                    buf.truncate(nul);
                }
                KvValue::Str(String::from_utf8(buf).context("nvs string is not UTF-8")?)
            }
            other => bail!("unexpected nvs entry type 0x{:x}", other),
        };
        Ok(Some(value))
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        unsafe { sys::nvs_close(self.0) };
    }
}

impl KvStore for EspKv {
    fn open(&mut self) -> Result<OpenStatus> {
        if self.initialised {
            return Ok(OpenStatus::Ready);
        }
        let err = unsafe { sys::nvs_flash_init() };
        if err == sys::ESP_ERR_NVS_NO_FREE_PAGES as sys::esp_err_t
            || err == sys::ESP_ERR_NVS_NEW_VERSION_FOUND as sys::esp_err_t
        {
            warn!("nvs: Partition needs erasing (error {})", err);
            return Ok(OpenStatus::NeedsErase);
        }
        esp!(err).context("nvs_flash_init")?;
        self.initialised = true;
        debug!("nvs: Open");
        Ok(OpenStatus::Ready)
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<KvValue>> {
        if !self.initialised {
            bail!("nvs is not open");
        }
        let key = cstr(key)?;
        match Reader::open(namespace)? {
            Some(reader) => reader.get(&key),
            None => Ok(None),
        }
    }

    fn set(&mut self, namespace: &str, key: &str, value: KvValue) -> Result<()> {
        let handle = self.writable(namespace)?;
        let name = cstr(key)?;
        let err = match &value {
            KvValue::U8(v) => unsafe { sys::nvs_set_u8(handle, name.as_ptr(), *v) },
            KvValue::U32(v) => unsafe { sys::nvs_set_u32(handle, name.as_ptr(), *v) },
            KvValue::Str(v) => {
                let v = cstr(v)?;
                unsafe { sys::nvs_set_str(handle, name.as_ptr(), v.as_ptr()) }
            }
        };
        esp!(err).with_context(|| format!("nvs_set {}/{}", namespace, key))
    }

    fn remove(&mut self, namespace: &str, key: &str) -> Result<()> {
        let handle = self.writable(namespace)?;
        let name = cstr(key)?;
        let err = unsafe { sys::nvs_erase_key(handle, name.as_ptr()) };
        if err == sys::ESP_ERR_NVS_NOT_FOUND as sys::esp_err_t {
            return Ok(());
        }
        esp!(err).with_context(|| format!("nvs_erase_key {}/{}", namespace, key))
    }

    fn commit(&mut self, namespace: &str) -> Result<()> {
        let handle = *self
            .handles
            .get(namespace)
            .ok_or_else(|| anyhow!("nothing staged in {}", namespace))?;
        esp!(unsafe { sys::nvs_commit(handle) }).with_context(|| format!("nvs_commit({})", namespace))
    }

    fn erase_region(&mut self) -> Result<()> {
        self.close_all();
        if self.initialised {
            esp!(unsafe { sys::nvs_flash_deinit() }).context("nvs_flash_deinit")?;
            self.initialised = false;
        }
        esp!(unsafe { sys::nvs_flash_erase() }).context("nvs_flash_erase")
    }

    fn region_label(&self) -> Option<&str> {
        Some(NVS_LABEL)
    }
}
