//! Lifecycle core for an ESP32 device: over-the-air updates from a release
//! feed, rapid-power-cycle factory reset, and the boot slot bookkeeping both
//! depend on.

#[macro_use]
mod logging;

pub mod actions;
pub mod boot;
pub mod config;
pub mod error;
pub mod factory_reset;
#[cfg(feature = "host")]
pub mod net;
pub mod ota;
pub mod platform;
pub mod release;
pub mod restart;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod slots;
pub mod state;
pub mod tasks;

pub use common::{SignatureRecord, VersionTriple};
