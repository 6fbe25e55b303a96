use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvValue {
    U8(u8),
    U32(u32),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStatus {
    Ready,
    /// The region is full or was written by an incompatible layout version and
    /// must be erased before it can be used
    NeedsErase,
}

/// Namespaced persistent records.
///
/// `set` and `remove` only stage a change. Nothing is durable until
/// `commit` returns for that namespace.
pub trait KvStore: Send {
    fn open(&mut self) -> Result<OpenStatus>;

    fn get(&self, namespace: &str, key: &str) -> Result<Option<KvValue>>;

    fn set(&mut self, namespace: &str, key: &str, value: KvValue) -> Result<()>;

    fn remove(&mut self, namespace: &str, key: &str) -> Result<()>;

    fn commit(&mut self, namespace: &str) -> Result<()>;

    /// Wipe the whole backing region. The store is closed afterwards and must
    /// be opened again before use.
    fn erase_region(&mut self) -> Result<()>;

    /// Flash label of the backing region, if it is a partition
    fn region_label(&self) -> Option<&str>;
}
