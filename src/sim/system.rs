use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{bail, Result};

use crate::platform::{ResetReason, System};

#[derive(Debug, Clone)]
pub struct SimState {
    pub reset_reason: ResetReason,
    pub running_version: String,
    pub restarts: usize,
    pub slept: Vec<Duration>,
    pub network_restores: usize,
    pub pairing_resets: usize,
    pub fail_network_restore: bool,
}

/// Chip services that record what the core asked for instead of doing it
#[derive(Clone)]
pub struct SimSystem {
    state: Arc<Mutex<SimState>>,
}

impl SimSystem {
    pub fn new(reset_reason: ResetReason, running_version: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                reset_reason,
                running_version: running_version.to_string(),
                restarts: 0,
                slept: Vec::new(),
                network_restores: 0,
                pairing_resets: 0,
                fail_network_restore: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> SimState {
        self.lock().clone()
    }

    pub fn set_reset_reason(&self, reason: ResetReason) {
        self.lock().reset_reason = reason;
    }

    pub fn set_running_version(&self, version: &str) {
        self.lock().running_version = version.to_string();
    }

    pub fn fail_network_restore(&self, fail: bool) {
        self.lock().fail_network_restore = fail;
    }

    pub fn restarts(&self) -> usize {
        self.lock().restarts
    }
}

impl System for SimSystem {
    fn reset_reason(&self) -> ResetReason {
        self.lock().reset_reason
    }

    fn running_version(&self) -> String {
        self.lock().running_version.clone()
    }

    fn restart(&mut self) {
        self.lock().restarts += 1;
    }

    fn sleep(&mut self, duration: Duration) {
        self.lock().slept.push(duration);
    }

    fn restore_network_defaults(&mut self) -> Result<()> {
        let mut state = self.lock();
        if state.fail_network_restore {
            bail!("wifi driver not initialised");
        }
        state.network_restores += 1;
        Ok(())
    }

    fn reset_pairing(&mut self) -> Result<()> {
        self.lock().pairing_resets += 1;
        Ok(())
    }
}
