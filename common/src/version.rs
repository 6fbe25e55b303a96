use core::cmp::Ordering;
use core::fmt;

use serde::{Deserialize, Serialize};

/// Semantic version triple parsed from a release tag or an image's embedded
/// version string.
///
/// Parsing never fails: malformed input yields `0.0.0` with `valid == false`,
/// and callers decide what an invalid triple means for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionTriple {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub valid: bool,
}

impl VersionTriple {
    pub const INVALID: VersionTriple = VersionTriple {
        major: 0,
        minor: 0,
        patch: 0,
        valid: false,
    };

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            valid: true,
        }
    }

    /// Parse `MAJOR.MINOR.PATCH` with one optional leading `v` or `V`
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        let s = s
            .strip_prefix('v')
            .or_else(|| s.strip_prefix('V'))
            .unwrap_or(s);

        let mut parts = s.split('.');
        let (Some(major), Some(minor), Some(patch), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Self::INVALID;
        };

        match (component(major), component(minor), component(patch)) {
            (Some(major), Some(minor), Some(patch)) => Self::new(major, minor, patch),
            _ => Self::INVALID,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Lexicographic comparison on `(major, minor, patch)`.
    /// Validity is ignored: invalid triples order as `0.0.0`.
    pub fn compare(&self, other: &VersionTriple) -> Ordering {
        self.key().cmp(&other.key())
    }

    pub fn is_newer_than(&self, other: &VersionTriple) -> bool {
        self.compare(other) == Ordering::Greater
    }

    fn key(&self) -> (u32, u32, u32) {
        if self.valid {
            (self.major, self.minor, self.patch)
        } else {
            (0, 0, 0)
        }
    }
}

/// Only plain ASCII digits; `str::parse` alone would accept a leading `+`
fn component(part: &str) -> Option<u32> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
