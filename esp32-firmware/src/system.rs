//! `System` on the chip's reset, restart and Wi-Fi services

use std::ffi::CStr;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use esp_idf_sys::{self as sys, esp};
use log::info;

use esp32_lifecycle::platform::{ResetReason, System};

/// NVS namespace the pairing layer keeps its controller keys in
pub const PAIRING_NAMESPACE: &str = "pairing";

pub struct EspSystem;

fn reset_reason() -> ResetReason {
    match unsafe { sys::esp_reset_reason() } {
        sys::esp_reset_reason_t_ESP_RST_POWERON => ResetReason::PowerOn,
        sys::esp_reset_reason_t_ESP_RST_EXT => ResetReason::External,
        sys::esp_reset_reason_t_ESP_RST_SW => ResetReason::Software,
        sys::esp_reset_reason_t_ESP_RST_PANIC => ResetReason::Panic,
        sys::esp_reset_reason_t_ESP_RST_INT_WDT => ResetReason::InterruptWatchdog,
        sys::esp_reset_reason_t_ESP_RST_TASK_WDT => ResetReason::TaskWatchdog,
        sys::esp_reset_reason_t_ESP_RST_WDT => ResetReason::Watchdog,
        sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => ResetReason::DeepSleep,
        sys::esp_reset_reason_t_ESP_RST_BROWNOUT => ResetReason::Brownout,
        sys::esp_reset_reason_t_ESP_RST_SDIO => ResetReason::Sdio,
        sys::esp_reset_reason_t_ESP_RST_PWR_GLITCH => ResetReason::PowerGlitch,
        _ => ResetReason::Unknown,
    }
}

impl System for EspSystem {
    fn reset_reason(&self) -> ResetReason {
        reset_reason()
    }

    fn running_version(&self) -> String {
        unsafe {
            let desc = sys::esp_app_get_description();
            if desc.is_null() {
                return String::new();
            }
            CStr::from_ptr((*desc).version.as_ptr())
                .to_string_lossy()
                .into_owned()
        }
    }

    fn restart(&mut self) {
        info!("system: Restarting");
        unsafe { sys::esp_restart() };
    }

    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }

    fn restore_network_defaults(&mut self) -> Result<()> {
        esp!(unsafe { sys::esp_wifi_restore() }).context("esp_wifi_restore")
    }

    fn reset_pairing(&mut self) -> Result<()> {
        let name = std::ffi::CString::new(PAIRING_NAMESPACE)?;
        let mut handle: sys::nvs_handle_t = 0;
        let err = unsafe { sys::nvs_open(name.as_ptr(), sys::nvs_open_mode_t_NVS_READWRITE, &mut handle) };
        esp!(err).context("nvs_open(pairing)")?;
        let result = esp!(unsafe { sys::nvs_erase_all(handle) })
            .and_then(|()| esp!(unsafe { sys::nvs_commit(handle) }))
            .context("clear pairing records");
        unsafe { sys::nvs_close(handle) };
        result
    }
}
