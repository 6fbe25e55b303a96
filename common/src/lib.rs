#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod feed;
pub mod signature;
pub mod version;

pub use feed::{Asset, Feed, Release};
pub use signature::{SignatureFormatError, SignatureRecord, DIGEST_LEN, SIGNATURE_RECORD_LEN};
pub use version::VersionTriple;
