//! Counting rapid power cycles across boots

use std::time::Duration;

use crate::config::RestartConfig;
use crate::error::LifecycleError;
use crate::platform::ResetReason;
use crate::state::PersistentStateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDecision {
    /// Previous reset did not count; the counter is 0
    Idle,
    /// Counter advanced. Arm the stable-window timer for `stable_window`.
    Counting { count: u32, stable_window: Duration },
    /// Enough rapid power cycles seen, run the factory reset
    ThresholdReached { count: u32 },
}

pub struct RestartCounter {
    threshold_min: u32,
    threshold_max: u32,
    stable_window: Duration,
}

impl RestartCounter {
    pub fn new(config: &RestartConfig) -> Self {
        Self {
            threshold_min: config.threshold_min,
            threshold_max: config.threshold_max.max(config.threshold_min),
            stable_window: Duration::from_millis(config.stable_window_ms),
        }
    }

    pub fn stable_window(&self) -> Duration {
        self.stable_window
    }

    /// Classify the previous reset and update the persisted count.
    ///
    /// Runs before anything else touches the KV store. The count is durable
    /// when this returns `Ok`.
    pub fn on_boot(
        &self,
        state: &mut PersistentStateStore,
        reason: ResetReason,
    ) -> Result<BootDecision, LifecycleError> {
        let stored = state.restart_count().unwrap_or_else(|err| {
            warn!("restart: Could not read restart count, assuming 0: {}", err);
            0
        });

        if !reason.is_operator_reset() {
            if stored != 0 {
                info!("restart: {} reset, clearing restart count {}", reason, stored);
                state.set_restart_count(0)?;
            }
            return Ok(BootDecision::Idle);
        }

        let count = stored.saturating_add(1).min(self.threshold_max);
        state.set_restart_count(count)?;

        if count >= self.threshold_min {
            warn!(
                "restart: {} consecutive power cycles ({}), factory reset threshold reached",
                count, reason
            );
            return Ok(BootDecision::ThresholdReached { count });
        }

        info!(
            "restart: Restart count {} of {} ({})",
            count, self.threshold_min, reason
        );
        Ok(BootDecision::Counting {
            count,
            stable_window: self.stable_window,
        })
    }

    /// The stable window ran out without another qualifying reset
    pub fn on_stable_window_elapsed(&self, state: &mut PersistentStateStore) -> Result<(), LifecycleError> {
        info!("restart: Stable for {:?}, clearing restart count", self.stable_window);
        self.reset(state)
    }

    pub fn reset(&self, state: &mut PersistentStateStore) -> Result<(), LifecycleError> {
        if state.restart_count()? != 0 {
            state.set_restart_count(0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{MemFlash, MemKv};

    fn counter() -> RestartCounter {
        RestartCounter::new(&RestartConfig::default())
    }

    fn fresh_state(flash: &MemFlash) -> PersistentStateStore {
        PersistentStateStore::new(Box::new(MemKv::new(flash.clone(), "nvs")))
    }

    #[test]
    fn test_count_is_min_of_resets_and_max() {
        let counter = counter();
        for n in 1..=15u32 {
            let flash = MemFlash::small();
            let mut last = BootDecision::Idle;
            for _ in 0..n {
                // A new store per boot, only committed state carries over
                let mut state = fresh_state(&flash);
                last = counter.on_boot(&mut state, ResetReason::PowerOn).unwrap();
            }
            let mut state = fresh_state(&flash);
            assert_eq!(state.restart_count().unwrap(), n.min(12), "after {} resets", n);

            match last {
                BootDecision::Counting { count, stable_window } => {
                    assert!(n < 10);
                    assert_eq!(count, n);
                    assert_eq!(stable_window, Duration::from_millis(5000));
                }
                BootDecision::ThresholdReached { count } => {
                    assert!(n >= 10);
                    assert_eq!(count, n.min(12));
                }
                BootDecision::Idle => panic!("power-on resets must count"),
            }
        }
    }

    #[test]
    fn test_non_operator_reset_clears() {
        let counter = counter();
        let flash = MemFlash::small();
        let mut state = fresh_state(&flash);
        counter.on_boot(&mut state, ResetReason::External).unwrap();
        counter.on_boot(&mut state, ResetReason::PowerOn).unwrap();
        assert_eq!(state.restart_count().unwrap(), 2);

        for reason in [ResetReason::Software, ResetReason::Panic, ResetReason::DeepSleep] {
            counter.on_boot(&mut state, ResetReason::PowerOn).unwrap();
            assert_eq!(counter.on_boot(&mut state, reason).unwrap(), BootDecision::Idle);
            assert_eq!(state.restart_count().unwrap(), 0);
        }
    }

    #[test]
    fn test_idle_boot_writes_nothing() {
        let counter = counter();
        let flash = MemFlash::small();
        let mut state = fresh_state(&flash);
        let before = flash.stats();
        counter.on_boot(&mut state, ResetReason::TaskWatchdog).unwrap();
        assert_eq!(flash.stats(), before);
    }

    #[test]
    fn test_stable_window_clears() {
        let counter = counter();
        let flash = MemFlash::small();
        let mut state = fresh_state(&flash);
        for _ in 0..3 {
            counter.on_boot(&mut state, ResetReason::PowerOn).unwrap();
        }
        counter.on_stable_window_elapsed(&mut state).unwrap();
        assert_eq!(fresh_state(&flash).restart_count().unwrap(), 0);
    }

    #[test]
    fn test_half_written_count_reads_as_zero() {
        let counter = counter();
        let flash = MemFlash::small();
        let mut state = fresh_state(&flash);
        state.set_restart_count(u32::MAX).unwrap();
        assert_eq!(
            counter.on_boot(&mut state, ResetReason::PowerOn).unwrap(),
            BootDecision::Counting {
                count: 1,
                stable_window: Duration::from_millis(5000)
            }
        );
    }
}
