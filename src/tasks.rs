//! Background workers and the device handle they share
//!
//! All flash and KV access goes through one `Arc<Mutex<Device>>`. A worker
//! holds the lock for a whole operation, so an update and a factory reset can
//! never interleave their writes.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::actions::{self, ButtonMap, ButtonPress, LifecycleAction};
use crate::boot::{run_boot_sequence, BootReport};
use crate::config::{RestartConfig, UpdateConfig};
use crate::error::{ErrorKind, LifecycleError};
use crate::factory_reset::{EraseReport, FactoryReset};
use crate::ota::{UpdateOutcome, UpdatePipeline};
use crate::platform::{FlashStore, HttpClient, System};
use crate::restart::RestartCounter;
use crate::state::{PersistentStateStore, PostResetReason, UpdateSource};

/// Everything the lifecycle core drives
pub struct Device {
    pub flash: Box<dyn FlashStore>,
    pub state: PersistentStateStore,
    pub http: Box<dyn HttpClient>,
    pub system: Box<dyn System>,
}

pub type SharedDevice = Arc<Mutex<Device>>;

/// Take the flash lock. A worker that panicked mid-operation leaves nothing
/// the next boot cannot recover from, so poisoning is ignored.
pub fn lock(device: &SharedDevice) -> MutexGuard<'_, Device> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Device {
    pub fn shared(self) -> SharedDevice {
        Arc::new(Mutex::new(self))
    }

    pub fn boot(&mut self, config: &RestartConfig) -> Result<BootReport, LifecycleError> {
        run_boot_sequence(&mut *self.flash, &mut self.state, &mut *self.system, config)
    }

    /// Update source stored on the device, else the configured one
    pub fn update_source(&mut self, config: &UpdateConfig) -> Option<UpdateSource> {
        let stored = self.state.update_source().unwrap_or_else(|err| {
            warn!("tasks: Could not read update source: {}", err);
            None
        });
        stored.or_else(|| {
            config.repo.as_ref().map(|repo| UpdateSource {
                repo: repo.clone(),
                prerelease: config.prerelease,
            })
        })
    }

    /// One full update check, restarting when the outcome needs it
    pub fn check_for_update(&mut self, config: &UpdateConfig) -> Result<UpdateOutcome, LifecycleError> {
        let source = self.update_source(config).ok_or(LifecycleError::NoUpdateSource)?;
        info!(
            "tasks: Checking updates for {} (prerelease: {})",
            source.repo, source.prerelease
        );

        let outcome = UpdatePipeline::new(
            &mut *self.flash,
            &mut self.state,
            &mut *self.http,
            &*self.system,
            config,
        )
        .check_and_update(&source.repo, source.prerelease)?;

        if outcome.requires_restart() {
            self.restart_for(PostResetReason::Update);
        }
        Ok(outcome)
    }

    pub fn restart_for(&mut self, reason: PostResetReason) {
        if let Err(err) = self.state.set_post_reset_reason(reason) {
            warn!("tasks: Could not record post-reset reason: {}", err);
        }
        info!("tasks: Restarting ({})", reason);
        self.system.restart();
    }
}

// =============================================================================
// Update worker
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTrigger {
    CheckNow,
}

pub struct UpdateWorker {
    triggers: mpsc::Sender<UpdateTrigger>,
    handle: JoinHandle<()>,
}

impl UpdateWorker {
    /// Waits for `online`, checks once, then again on every trigger or after
    /// `check_interval_secs`
    pub fn spawn(device: SharedDevice, config: UpdateConfig, online: oneshot::Receiver<()>) -> io::Result<Self> {
        let (triggers, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("lcm-update".into())
            .spawn(move || update_worker(device, config, online, rx))?;
        Ok(Self { triggers, handle })
    }

    /// Ask for a check now. Returns false once the worker has exited.
    pub fn trigger(&self) -> bool {
        self.triggers.send(UpdateTrigger::CheckNow).is_ok()
    }

    /// Stop after the current check and wait for the thread
    pub fn shutdown(self) -> thread::Result<()> {
        drop(self.triggers);
        self.handle.join()
    }
}

fn update_worker(
    device: SharedDevice,
    config: UpdateConfig,
    online: oneshot::Receiver<()>,
    triggers: mpsc::Receiver<UpdateTrigger>,
) {
    if online.blocking_recv().is_err() {
        warn!("tasks: Connectivity signal dropped, update worker exiting");
        return;
    }
    info!("tasks: Network up, starting update worker");

    let interval = Duration::from_secs(config.check_interval_secs);
    loop {
        run_update_check(&device, &config);
        match triggers.recv_timeout(interval) {
            Ok(UpdateTrigger::CheckNow) => debug!("tasks: Update check triggered"),
            Err(RecvTimeoutError::Timeout) => debug!("tasks: Periodic update check"),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("tasks: Update worker stopped");
}

/// One check under the flash lock. Failures are logged and left for the
/// next cycle.
pub fn run_update_check(device: &SharedDevice, config: &UpdateConfig) -> Option<UpdateOutcome> {
    let mut device = lock(device);
    match device.check_for_update(config) {
        Ok(outcome) => Some(outcome),
        Err(LifecycleError::NoUpdateSource) => {
            warn!("tasks: No update repository configured, skipping update check");
            None
        }
        Err(err) => {
            match err.kind() {
                ErrorKind::Transient => warn!("tasks: Update check failed, retrying next cycle: {}", err),
                ErrorKind::Verification => error!("tasks: Firmware rejected: {}", err),
                _ => error!("tasks: Update failed: {}", err),
            }
            None
        }
    }
}

// =============================================================================
// Restart counter stable window
// =============================================================================

/// Clears the restart count once the device has stayed up for the window
pub struct StableWindowTimer {
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<bool>,
}

impl StableWindowTimer {
    pub fn arm(device: SharedDevice, config: &RestartConfig, window: Duration) -> io::Result<Self> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let counter = RestartCounter::new(config);
        debug!("tasks: Stable window armed for {:?}", window);

        let handle = thread::Builder::new()
            .name("lcm-stable".into())
            .spawn(move || {
                thread::sleep(window);
                if flag.load(Ordering::SeqCst) {
                    return false;
                }
                let mut device = lock(&device);
                match counter.on_stable_window_elapsed(&mut device.state) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!("tasks: Could not clear restart count: {}", err);
                        false
                    }
                }
            })?;
        Ok(Self { cancelled, handle })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the count was cleared
    pub fn join(self) -> bool {
        self.handle.join().unwrap_or(false)
    }
}

// =============================================================================
// Factory reset worker
// =============================================================================

/// Countdown and erase on a dedicated thread, holding the flash lock
/// throughout. Ends in a restart.
pub fn spawn_factory_reset(
    device: SharedDevice,
    countdown_secs: u32,
) -> io::Result<JoinHandle<Result<EraseReport, LifecycleError>>> {
    thread::Builder::new()
        .name("lcm-reset".into())
        .spawn(move || {
            let mut device = lock(&device);
            let device = &mut *device;
            FactoryReset::new(&mut *device.flash, &mut device.state, &mut *device.system).run(countdown_secs)
        })
}

// =============================================================================
// Buttons
// =============================================================================

/// Run whatever `press` is mapped to
pub fn handle_press(
    device: &SharedDevice,
    buttons: &ButtonMap,
    press: ButtonPress,
) -> Result<LifecycleAction, LifecycleError> {
    let action = buttons.action_for(press);
    info!("tasks: {:?} press -> {:?}", press, action);

    let mut device = lock(device);
    let device = &mut *device;
    match action {
        LifecycleAction::NoOp => {}
        LifecycleAction::RequestUpdate => {
            actions::request_update_and_reboot(&mut *device.flash, &mut device.state, &mut *device.system)?;
        }
        LifecycleAction::ResetPairing => {
            actions::reset_pairing_and_reboot(&mut device.state, &mut *device.system)?;
        }
        LifecycleAction::FactoryReset => {
            FactoryReset::new(&mut *device.flash, &mut device.state, &mut *device.system).run(0)?;
        }
    }
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ResetReason;
    use crate::sim::image::build_image;
    use crate::sim::{MemFlash, MemKv, SimBoard};

    fn board() -> SimBoard {
        let flash = MemFlash::small();
        flash.flash_image("factory", &build_image("1.0.0", &[0; 128])).unwrap();
        SimBoard::new(flash, ResetReason::PowerOn, "1.0.0")
    }

    #[test]
    fn test_stable_window_clears_count() {
        let board = board();
        let device = board.device().shared();
        let config = RestartConfig::default();
        lock(&device).state.set_restart_count(3).unwrap();

        let timer = StableWindowTimer::arm(device.clone(), &config, Duration::from_millis(10)).unwrap();
        assert!(timer.join());
        assert_eq!(board.state().restart_count().unwrap(), 0);
    }

    #[test]
    fn test_cancelled_stable_window_keeps_count() {
        let board = board();
        let device = board.device().shared();
        lock(&device).state.set_restart_count(3).unwrap();

        let timer =
            StableWindowTimer::arm(device.clone(), &RestartConfig::default(), Duration::from_millis(50)).unwrap();
        timer.cancel();
        assert!(!timer.join());
        assert_eq!(board.state().restart_count().unwrap(), 3);
    }

    #[test]
    fn test_update_worker_waits_for_connectivity() {
        let board = board();
        let device = board.device().shared();
        let (online, waiter) = oneshot::channel();

        let worker = UpdateWorker::spawn(device, UpdateConfig::default(), waiter).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(board.http.requests().is_empty());

        drop(online);
        worker.shutdown().unwrap();
        assert!(board.http.requests().is_empty());
    }

    #[test]
    fn test_no_update_source_skips() {
        let board = board();
        let device = board.device().shared();
        assert_eq!(run_update_check(&device, &UpdateConfig::default()), None);
        assert!(board.http.requests().is_empty());
    }

    #[test]
    fn test_stored_update_source_wins() {
        let board = board();
        let mut device = board.device();
        device
            .state
            .set_update_source(&UpdateSource {
                repo: "acme/stored".into(),
                prerelease: true,
            })
            .unwrap();
        let config = UpdateConfig {
            repo: Some("acme/configured".into()),
            ..UpdateConfig::default()
        };
        assert_eq!(device.update_source(&config).unwrap().repo, "acme/stored");

        let mut blank = SimBoard::new(MemFlash::small(), ResetReason::PowerOn, "1.0.0").device();
        let source = blank.update_source(&config).unwrap();
        assert_eq!(source.repo, "acme/configured");
        assert!(!source.prerelease);
    }

    #[test]
    fn test_noop_press() {
        let board = board();
        let device = board.device().shared();
        let buttons = ButtonMap {
            double: LifecycleAction::NoOp,
            ..ButtonMap::default()
        };
        assert_eq!(
            handle_press(&device, &buttons, ButtonPress::Double).unwrap(),
            LifecycleAction::NoOp
        );
        assert_eq!(board.system.restarts(), 0);
    }

    #[test]
    fn test_long_press_factory_resets_without_countdown() {
        let board = board();
        board
            .flash
            .flash_image("ota_0", &build_image("1.1.0", &[0; 128]))
            .unwrap();
        let device = board.device().shared();

        handle_press(&device, &ButtonMap::default(), ButtonPress::Long).unwrap();
        assert!(board.system.snapshot().slept.is_empty());
        assert!(board.flash.is_erased("ota_0").unwrap());
        assert_eq!(board.system.restarts(), 1);
        assert_eq!(
            MemKv::peek(&board.flash, "nvs", "post-reset", "reason").unwrap(),
            Some(crate::platform::KvValue::Str("factory".into()))
        );
    }
}
