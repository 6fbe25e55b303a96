use std::collections::BTreeSet;
use std::fmt;

/// Which image is installed where, as last committed by the update pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledFirmwareRecord {
    pub version: String,
    pub slot_label: String,
}

impl InstalledFirmwareRecord {
    pub fn new(version: impl Into<String>, slot_label: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            slot_label: slot_label.into(),
        }
    }
}

/// Where update checks look for releases
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSource {
    pub repo: String,
    pub prerelease: bool,
}

/// Why the lifecycle core itself last restarted the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostResetReason {
    /// Pairings were cleared
    Pairing,
    /// Factory reset ran
    Factory,
    /// Rebooted into the updater to apply an update
    Update,
}

impl PostResetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostResetReason::Pairing => "pairing",
            PostResetReason::Factory => "factory",
            PostResetReason::Update => "update",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pairing" => Some(PostResetReason::Pairing),
            "factory" => Some(PostResetReason::Factory),
            "update" => Some(PostResetReason::Update),
            _ => None,
        }
    }
}

impl fmt::Display for PostResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slots a factory reset still owes an erase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingErasureSet {
    slots: BTreeSet<String>,
}

impl PendingErasureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: impl Into<String>) -> bool {
        self.slots.insert(label.into())
    }

    pub fn remove(&mut self, label: &str) -> bool {
        self.slots.remove(label)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.slots.contains(label)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(String::as_str)
    }

    /// Comma-separated, as stored in the KV record
    pub fn encode(&self) -> String {
        self.slots.iter().cloned().collect::<Vec<_>>().join(",")
    }

    pub fn decode(raw: &str) -> Self {
        Self {
            slots: raw
                .split(',')
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_set_encoding() {
        let mut set = PendingErasureSet::new();
        set.insert("ota_1");
        set.insert("otadata");
        set.insert("ota_1");
        assert_eq!(set.encode(), "ota_1,otadata");
        assert_eq!(PendingErasureSet::decode(&set.encode()), set);
        assert!(PendingErasureSet::decode("").is_empty());
        assert!(PendingErasureSet::decode(" ota_0 ,,").contains("ota_0"));
    }

    #[test]
    fn test_post_reset_reason_names() {
        for reason in [
            PostResetReason::Pairing,
            PostResetReason::Factory,
            PostResetReason::Update,
        ] {
            assert_eq!(PostResetReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(PostResetReason::parse("homekit"), None);
    }
}
