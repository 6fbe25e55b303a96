//! Seams to the device: flash partitions, the KV store, HTTP and the chip itself.
//!
//! The core only ever talks to these traits. `crate::sim` implements them in
//! memory for tests and the host simulator, the firmware crate implements them
//! on top of ESP-IDF.

pub mod esp_image;
pub mod flash;
pub mod http;
pub mod kv;
pub mod system;

pub use flash::{FlashStore, ImageInfo, SlotInfo, SlotKind, ERASED_BYTE, SECTOR_SIZE};
pub use http::{HttpClient, HttpRequest, HttpResponse};
pub use kv::{KvStore, KvValue, OpenStatus};
pub use system::{ResetReason, System};
