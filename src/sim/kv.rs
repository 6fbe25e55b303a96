use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};

use crate::platform::{FlashStore, KvStore, KvValue, OpenStatus, ERASED_BYTE};

use super::flash::MemFlash;

type Namespaces = BTreeMap<String, BTreeMap<String, KvValue>>;

/// Switches for making the next KV operations fail
#[derive(Debug, Clone, Default)]
pub struct KvFaults {
    fail_commit: Arc<AtomicBool>,
    fail_open: Arc<AtomicBool>,
}

impl KvFaults {
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_opens(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }
}

/// KV store persisted into a partition of a [`MemFlash`].
///
/// Committed namespaces are serialised into the region, so a fresh `MemKv`
/// over the same flash sees exactly what survived, and uncommitted changes
/// vanish with the instance the way they do on a power cut.
pub struct MemKv {
    flash: MemFlash,
    label: String,
    durable: Option<Namespaces>,
    staged: BTreeMap<String, BTreeMap<String, Option<KvValue>>>,
    faults: KvFaults,
}

impl MemKv {
    pub fn new(flash: MemFlash, label: &str) -> Self {
        Self {
            flash,
            label: label.to_string(),
            durable: None,
            staged: BTreeMap::new(),
            faults: KvFaults::default(),
        }
    }

    pub fn faults(&self) -> KvFaults {
        self.faults.clone()
    }

    /// Open a second view of the same region and read one committed value
    pub fn peek(flash: &MemFlash, label: &str, namespace: &str, key: &str) -> Result<Option<KvValue>> {
        let mut view = MemKv::new(flash.clone(), label);
        if view.open()? == OpenStatus::NeedsErase {
            bail!("kv region {} is not readable", label);
        }
        view.get(namespace, key)
    }

    fn load(&self) -> Result<Option<Namespaces>> {
        let mut len = [0u8; 4];
        self.flash.read(&self.label, 0, &mut len)?;
        if len == [ERASED_BYTE; 4] {
            return Ok(Some(Namespaces::new()));
        }

        let len = u32::from_be_bytes(len);
        let size = self
            .flash
            .slot(&self.label)
            .map(|slot| slot.size)
            .unwrap_or(0);
        if len > size.saturating_sub(4) {
            return Ok(None);
        }

        let mut raw = vec![0u8; len as usize];
        self.flash.read(&self.label, 4, &mut raw)?;
        Ok(serde_json::from_slice(&raw).ok())
    }

    fn persist(&mut self, namespaces: &Namespaces) -> Result<()> {
        let raw = serde_json::to_vec(namespaces).context("serialising kv namespaces")?;
        let mut record = (raw.len() as u32).to_be_bytes().to_vec();
        record.extend_from_slice(&raw);

        let size = self
            .flash
            .slot(&self.label)
            .map(|slot| slot.size)
            .ok_or_else(|| anyhow!("no partition labelled {}", self.label))?;
        if record.len() > size as usize {
            bail!("kv region {} is full", self.label);
        }

        self.flash.erase_slot(&self.label)?;
        self.flash.write(&self.label, 0, &record)
    }

    fn durable(&self) -> Result<&Namespaces> {
        self.durable
            .as_ref()
            .ok_or_else(|| anyhow!("kv store {} is not open", self.label))
    }
}

impl KvStore for MemKv {
    fn open(&mut self) -> Result<OpenStatus> {
        if self.faults.fail_open.load(Ordering::SeqCst) {
            bail!("injected open failure");
        }
        self.staged.clear();
        match self.load()? {
            Some(namespaces) => {
                self.durable = Some(namespaces);
                Ok(OpenStatus::Ready)
            }
            None => {
                self.durable = None;
                Ok(OpenStatus::NeedsErase)
            }
        }
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<KvValue>> {
        if let Some(staged) = self.staged.get(namespace).and_then(|keys| keys.get(key)) {
            return Ok(staged.clone());
        }
        Ok(self
            .durable()?
            .get(namespace)
            .and_then(|keys| keys.get(key))
            .cloned())
    }

    fn set(&mut self, namespace: &str, key: &str, value: KvValue) -> Result<()> {
        self.durable()?;
        self.staged
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), Some(value));
        Ok(())
    }

    fn remove(&mut self, namespace: &str, key: &str) -> Result<()> {
        self.durable()?;
        self.staged
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), None);
        Ok(())
    }

    fn commit(&mut self, namespace: &str) -> Result<()> {
        if self.faults.fail_commit.load(Ordering::SeqCst) {
            bail!("injected commit failure");
        }
        let mut next = self.durable()?.clone();
        if let Some(changes) = self.staged.get(namespace) {
            let keys = next.entry(namespace.to_string()).or_default();
            for (key, value) in changes {
                match value {
                    Some(value) => keys.insert(key.clone(), value.clone()),
                    None => keys.remove(key),
                };
            }
            if keys.is_empty() {
                next.remove(namespace);
            }
        }

        self.persist(&next)?;
        self.staged.remove(namespace);
        self.durable = Some(next);
        Ok(())
    }

    fn erase_region(&mut self) -> Result<()> {
        self.durable = None;
        self.staged.clear();
        self.flash.erase_slot(&self.label)
    }

    fn region_label(&self) -> Option<&str> {
        Some(&self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncommitted_changes_do_not_survive() {
        let flash = MemFlash::small();
        let mut kv = MemKv::new(flash.clone(), "nvs");
        assert_eq!(kv.open().unwrap(), OpenStatus::Ready);

        kv.set("restart-state", "count", KvValue::U32(3)).unwrap();
        kv.commit("restart-state").unwrap();
        kv.set("update-flag", "pending", KvValue::U8(1)).unwrap();
        assert_eq!(kv.get("update-flag", "pending").unwrap(), Some(KvValue::U8(1)));

        assert_eq!(
            MemKv::peek(&flash, "nvs", "restart-state", "count").unwrap(),
            Some(KvValue::U32(3))
        );
        assert_eq!(MemKv::peek(&flash, "nvs", "update-flag", "pending").unwrap(), None);
    }

    #[test]
    fn test_commit_is_per_namespace() {
        let flash = MemFlash::small();
        let mut kv = MemKv::new(flash.clone(), "nvs");
        kv.open().unwrap();

        kv.set("a", "x", KvValue::Str("one".into())).unwrap();
        kv.set("b", "y", KvValue::Str("two".into())).unwrap();
        kv.commit("b").unwrap();

        assert_eq!(MemKv::peek(&flash, "nvs", "a", "x").unwrap(), None);
        assert_eq!(
            MemKv::peek(&flash, "nvs", "b", "y").unwrap(),
            Some(KvValue::Str("two".into()))
        );
    }

    #[test]
    fn test_garbage_region_needs_erase() {
        let flash = MemFlash::small();
        flash.flash_image("nvs", &[0, 0, 0, 9, b'{', b'x']).unwrap();

        let mut kv = MemKv::new(flash.clone(), "nvs");
        assert_eq!(kv.open().unwrap(), OpenStatus::NeedsErase);
        assert!(kv.get("a", "b").is_err());

        kv.erase_region().unwrap();
        assert_eq!(kv.open().unwrap(), OpenStatus::Ready);
    }

    #[test]
    fn test_remove_then_commit() {
        let flash = MemFlash::small();
        let mut kv = MemKv::new(flash.clone(), "nvs");
        kv.open().unwrap();
        kv.set("ns", "k", KvValue::U8(1)).unwrap();
        kv.commit("ns").unwrap();
        kv.remove("ns", "k").unwrap();
        assert_eq!(kv.get("ns", "k").unwrap(), None);
        kv.commit("ns").unwrap();
        assert_eq!(MemKv::peek(&flash, "nvs", "ns", "k").unwrap(), None);
    }
}
