use std::fmt;
use std::time::Duration;

use anyhow::Result;

/// Why the chip last came out of reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetReason {
    PowerOn,
    External,
    Software,
    Panic,
    InterruptWatchdog,
    TaskWatchdog,
    Watchdog,
    DeepSleep,
    Brownout,
    Sdio,
    PowerGlitch,
    Unknown,
}

impl ResetReason {
    pub fn name(&self) -> &'static str {
        match self {
            ResetReason::PowerOn => "POWERON",
            ResetReason::External => "EXTERNAL",
            ResetReason::Software => "SOFTWARE",
            ResetReason::Panic => "PANIC",
            ResetReason::InterruptWatchdog => "INT_WDT",
            ResetReason::TaskWatchdog => "TASK_WDT",
            ResetReason::Watchdog => "WDT",
            ResetReason::DeepSleep => "DEEPSLEEP",
            ResetReason::Brownout => "BROWNOUT",
            ResetReason::Sdio => "SDIO",
            ResetReason::PowerGlitch => "PWOFF",
            ResetReason::Unknown => "UNKNOWN",
        }
    }

    /// Only resets an operator can cause by cycling power or pressing the
    /// reset line advance the restart counter
    pub fn is_operator_reset(&self) -> bool {
        matches!(self, ResetReason::PowerOn | ResetReason::External)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let reason = match name.to_ascii_uppercase().as_str() {
            "POWERON" => ResetReason::PowerOn,
            "EXTERNAL" | "EXT" => ResetReason::External,
            "SOFTWARE" | "SW" => ResetReason::Software,
            "PANIC" => ResetReason::Panic,
            "INT_WDT" => ResetReason::InterruptWatchdog,
            "TASK_WDT" => ResetReason::TaskWatchdog,
            "WDT" => ResetReason::Watchdog,
            "DEEPSLEEP" => ResetReason::DeepSleep,
            "BROWNOUT" => ResetReason::Brownout,
            "SDIO" => ResetReason::Sdio,
            "PWOFF" => ResetReason::PowerGlitch,
            "UNKNOWN" => ResetReason::Unknown,
            _ => return None,
        };
        Some(reason)
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Chip-level services plus the hooks into collaborators the core does not own
pub trait System: Send {
    fn reset_reason(&self) -> ResetReason;

    /// Version string embedded in the running image
    fn running_version(&self) -> String;

    /// On hardware this does not return
    fn restart(&mut self);

    fn sleep(&mut self, duration: Duration);

    /// Put radio and network configuration back to factory defaults
    fn restore_network_defaults(&mut self) -> Result<()>;

    /// Forget every paired controller
    fn reset_pairing(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_operator_resets_count() {
        let counted: Vec<_> = [
            ResetReason::PowerOn,
            ResetReason::External,
            ResetReason::Software,
            ResetReason::Panic,
            ResetReason::InterruptWatchdog,
            ResetReason::TaskWatchdog,
            ResetReason::Watchdog,
            ResetReason::DeepSleep,
            ResetReason::Brownout,
            ResetReason::Sdio,
            ResetReason::PowerGlitch,
            ResetReason::Unknown,
        ]
        .into_iter()
        .filter(ResetReason::is_operator_reset)
        .collect();

        assert_eq!(counted, vec![ResetReason::PowerOn, ResetReason::External]);
    }

    #[test]
    fn test_names_round_trip() {
        for reason in [ResetReason::TaskWatchdog, ResetReason::PowerGlitch, ResetReason::External] {
            assert_eq!(ResetReason::from_name(reason.name()), Some(reason));
        }
        assert_eq!(ResetReason::from_name("poweron"), Some(ResetReason::PowerOn));
        assert_eq!(ResetReason::from_name("reboot"), None);
    }
}
