use anyhow::anyhow;

use crate::error::LifecycleError;
use crate::platform::{KvStore, KvValue, OpenStatus};

use super::types::{InstalledFirmwareRecord, PendingErasureSet, PostResetReason, UpdateSource};

pub const UPDATE_FLAG_NS: &str = "update-flag";
pub const UPDATE_FLAG_KEY: &str = "pending";

pub const FIRMWARE_NS: &str = "firmware-record";
pub const FIRMWARE_VERSION_KEY: &str = "version";
pub const FIRMWARE_SLOT_KEY: &str = "slot";

pub const RESTART_NS: &str = "restart-state";
pub const RESTART_COUNT_KEY: &str = "count";

pub const FACTORY_RESET_NS: &str = "factory-reset";
pub const FACTORY_RESET_PENDING_KEY: &str = "pending";

pub const UPDATE_SOURCE_NS: &str = "update-source";
pub const UPDATE_SOURCE_REPO_KEY: &str = "repo";
pub const UPDATE_SOURCE_PRERELEASE_KEY: &str = "prerelease";

pub const POST_RESET_NS: &str = "post-reset";
pub const POST_RESET_REASON_KEY: &str = "reason";

/// Every piece of lifecycle state that has to survive a reboot.
///
/// Opened on first use. Each mutation is committed before the call returns;
/// a value is only ever reported as saved once the commit succeeded.
pub struct PersistentStateStore {
    kv: Box<dyn KvStore>,
    open: bool,
}

impl PersistentStateStore {
    pub fn new(kv: Box<dyn KvStore>) -> Self {
        Self { kv, open: false }
    }

    fn ensure_open(&mut self) -> Result<(), LifecycleError> {
        if self.open {
            return Ok(());
        }

        let status = self
            .kv
            .open()
            .map_err(|e| LifecycleError::store("open", "*", "*", e))?;
        if status == OpenStatus::NeedsErase {
            warn!("state::store: KV region unusable, erasing and reopening");
            self.kv
                .erase_region()
                .map_err(|e| LifecycleError::store("erase", "*", "*", e))?;
            let status = self
                .kv
                .open()
                .map_err(|e| LifecycleError::store("open", "*", "*", e))?;
            if status != OpenStatus::Ready {
                return Err(LifecycleError::store(
                    "open",
                    "*",
                    "*",
                    anyhow!("region still unusable after erase"),
                ));
            }
        }

        self.open = true;
        Ok(())
    }

    fn get(
        &mut self,
        namespace: &'static str,
        key: &'static str,
    ) -> Result<Option<KvValue>, LifecycleError> {
        self.ensure_open()?;
        self.kv
            .get(namespace, key)
            .map_err(|e| LifecycleError::store("read", namespace, key, e))
    }

    fn get_u32(&mut self, namespace: &'static str, key: &'static str) -> Result<Option<u32>, LifecycleError> {
        match self.get(namespace, key)? {
            None => Ok(None),
            Some(KvValue::U32(value)) => Ok(Some(value)),
            Some(other) => {
                warn!("state::store: {}/{} holds {:?}, expected u32", namespace, key, other);
                Ok(None)
            }
        }
    }

    fn get_u8(&mut self, namespace: &'static str, key: &'static str) -> Result<Option<u8>, LifecycleError> {
        match self.get(namespace, key)? {
            None => Ok(None),
            Some(KvValue::U8(value)) => Ok(Some(value)),
            Some(other) => {
                warn!("state::store: {}/{} holds {:?}, expected u8", namespace, key, other);
                Ok(None)
            }
        }
    }

    fn get_str(&mut self, namespace: &'static str, key: &'static str) -> Result<Option<String>, LifecycleError> {
        match self.get(namespace, key)? {
            None => Ok(None),
            Some(KvValue::Str(value)) => Ok(Some(value)),
            Some(other) => {
                warn!("state::store: {}/{} holds {:?}, expected string", namespace, key, other);
                Ok(None)
            }
        }
    }

    fn stage(
        &mut self,
        namespace: &'static str,
        key: &'static str,
        value: Option<KvValue>,
    ) -> Result<(), LifecycleError> {
        self.ensure_open()?;
        let staged = match value {
            Some(value) => self.kv.set(namespace, key, value),
            None => self.kv.remove(namespace, key),
        };
        staged.map_err(|e| LifecycleError::store("write", namespace, key, e))
    }

    fn commit(&mut self, namespace: &'static str, key: &'static str) -> Result<(), LifecycleError> {
        self.kv
            .commit(namespace)
            .map_err(|e| LifecycleError::store("commit", namespace, key, e))
    }

    fn put(
        &mut self,
        namespace: &'static str,
        key: &'static str,
        value: Option<KvValue>,
    ) -> Result<(), LifecycleError> {
        self.stage(namespace, key, value)?;
        self.commit(namespace, key)
    }

    // =========================================================================
    // Installed firmware
    // =========================================================================

    pub fn installed_firmware(&mut self) -> Result<Option<InstalledFirmwareRecord>, LifecycleError> {
        let version = self.get_str(FIRMWARE_NS, FIRMWARE_VERSION_KEY)?;
        let slot = self.get_str(FIRMWARE_NS, FIRMWARE_SLOT_KEY)?;
        Ok(match (version, slot) {
            (Some(version), Some(slot_label)) => Some(InstalledFirmwareRecord { version, slot_label }),
            _ => None,
        })
    }

    /// Returns whether anything had to be written
    pub fn record_installed(&mut self, record: &InstalledFirmwareRecord) -> Result<bool, LifecycleError> {
        let current = match self.installed_firmware() {
            Ok(current) => current,
            Err(err) => {
                warn!("state::store: Could not read installed record before write: {}", err);
                None
            }
        };
        if current.as_ref() == Some(record) {
            debug!("state::store: Installed record already {:?}", record);
            return Ok(false);
        }

        let old_version = current.as_ref().map(|c| c.version.as_str());
        let old_slot = current.as_ref().map(|c| c.slot_label.as_str());
        if old_version != Some(record.version.as_str()) {
            self.stage(
                FIRMWARE_NS,
                FIRMWARE_VERSION_KEY,
                Some(KvValue::Str(record.version.clone())),
            )?;
        }
        if old_slot != Some(record.slot_label.as_str()) {
            self.stage(
                FIRMWARE_NS,
                FIRMWARE_SLOT_KEY,
                Some(KvValue::Str(record.slot_label.clone())),
            )?;
        }
        self.commit(FIRMWARE_NS, FIRMWARE_VERSION_KEY)?;

        info!(
            "state::store: Installed firmware recorded as {} in {}",
            record.version, record.slot_label
        );
        Ok(true)
    }

    // =========================================================================
    // Update request flag
    // =========================================================================

    pub fn update_requested(&mut self) -> Result<bool, LifecycleError> {
        Ok(self.get_u8(UPDATE_FLAG_NS, UPDATE_FLAG_KEY)?.unwrap_or(0) != 0)
    }

    pub fn set_update_requested(&mut self, pending: bool) -> Result<(), LifecycleError> {
        self.put(UPDATE_FLAG_NS, UPDATE_FLAG_KEY, Some(KvValue::U8(pending as u8)))
    }

    // =========================================================================
    // Restart counter
    // =========================================================================

    pub fn restart_count(&mut self) -> Result<u32, LifecycleError> {
        Ok(match self.get_u32(RESTART_NS, RESTART_COUNT_KEY)? {
            // Left over from a half-initialised record
            Some(u32::MAX) | None => 0,
            Some(count) => count,
        })
    }

    pub fn set_restart_count(&mut self, count: u32) -> Result<(), LifecycleError> {
        self.put(RESTART_NS, RESTART_COUNT_KEY, Some(KvValue::U32(count)))
    }

    // =========================================================================
    // Deferred factory-reset erasures
    // =========================================================================

    pub fn pending_erasure(&mut self) -> Result<PendingErasureSet, LifecycleError> {
        Ok(self
            .get_str(FACTORY_RESET_NS, FACTORY_RESET_PENDING_KEY)?
            .map(|raw| PendingErasureSet::decode(&raw))
            .unwrap_or_default())
    }

    pub fn set_pending_erasure(&mut self, pending: &PendingErasureSet) -> Result<(), LifecycleError> {
        let value = (!pending.is_empty()).then(|| KvValue::Str(pending.encode()));
        self.put(FACTORY_RESET_NS, FACTORY_RESET_PENDING_KEY, value)
    }

    // =========================================================================
    // Update source
    // =========================================================================

    pub fn update_source(&mut self) -> Result<Option<UpdateSource>, LifecycleError> {
        let Some(repo) = self.get_str(UPDATE_SOURCE_NS, UPDATE_SOURCE_REPO_KEY)? else {
            return Ok(None);
        };
        if repo.is_empty() {
            return Ok(None);
        }
        let prerelease = self
            .get_u8(UPDATE_SOURCE_NS, UPDATE_SOURCE_PRERELEASE_KEY)?
            .unwrap_or(0)
            != 0;
        Ok(Some(UpdateSource { repo, prerelease }))
    }

    pub fn set_update_source(&mut self, source: &UpdateSource) -> Result<(), LifecycleError> {
        self.stage(
            UPDATE_SOURCE_NS,
            UPDATE_SOURCE_REPO_KEY,
            Some(KvValue::Str(source.repo.clone())),
        )?;
        self.stage(
            UPDATE_SOURCE_NS,
            UPDATE_SOURCE_PRERELEASE_KEY,
            Some(KvValue::U8(source.prerelease as u8)),
        )?;
        self.commit(UPDATE_SOURCE_NS, UPDATE_SOURCE_REPO_KEY)
    }

    // =========================================================================
    // Post-reset reason
    // =========================================================================

    pub fn set_post_reset_reason(&mut self, reason: PostResetReason) -> Result<(), LifecycleError> {
        self.put(
            POST_RESET_NS,
            POST_RESET_REASON_KEY,
            Some(KvValue::Str(reason.as_str().to_string())),
        )
    }

    /// Read and clear in one go so a reason is reported for exactly one boot
    pub fn take_post_reset_reason(&mut self) -> Result<Option<PostResetReason>, LifecycleError> {
        let Some(raw) = self.get_str(POST_RESET_NS, POST_RESET_REASON_KEY)? else {
            return Ok(None);
        };
        self.put(POST_RESET_NS, POST_RESET_REASON_KEY, None)?;
        Ok(PostResetReason::parse(&raw))
    }

    // =========================================================================
    // Region
    // =========================================================================

    /// Wipe every namespace. The next access reopens a blank store.
    pub fn erase_region(&mut self) -> Result<(), LifecycleError> {
        self.open = false;
        self.kv
            .erase_region()
            .map_err(|e| LifecycleError::store("erase", "*", "*", e))
    }

    pub fn region_label(&self) -> Option<String> {
        self.kv.region_label().map(str::to_string)
    }
}
