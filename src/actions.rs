//! Button actions and the restarts they end in

use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;
use crate::platform::{FlashStore, System};
use crate::slots::SlotManager;
use crate::state::{PersistentStateStore, PostResetReason};

/// What the button adapter reports after debouncing and click counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ButtonPress {
    Single,
    Double,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum LifecycleAction {
    NoOp,
    /// Flag an update and reboot into the updater
    RequestUpdate,
    ResetPairing,
    /// Erase without the power-cycle countdown
    FactoryReset,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ButtonMap {
    pub single: LifecycleAction,
    pub double: LifecycleAction,
    pub long: LifecycleAction,
}

impl Default for ButtonMap {
    fn default() -> Self {
        Self {
            single: LifecycleAction::RequestUpdate,
            double: LifecycleAction::ResetPairing,
            long: LifecycleAction::FactoryReset,
        }
    }
}

impl ButtonMap {
    pub fn action_for(&self, press: ButtonPress) -> LifecycleAction {
        match press {
            ButtonPress::Single => self.single,
            ButtonPress::Double => self.double,
            ButtonPress::Long => self.long,
        }
    }
}

/// Set the update flag, hand the next boot to the factory updater and restart.
///
/// The flag has to be durable before anything else happens; if it cannot be
/// saved nothing is restarted. A missing factory slot or a boot pointer that
/// cannot be moved is logged and the restart still happens, the flag is then
/// picked up by the running image.
pub fn request_update_and_reboot(
    flash: &mut dyn FlashStore,
    state: &mut PersistentStateStore,
    system: &mut dyn System,
) -> Result<(), LifecycleError> {
    state.set_update_requested(true)?;
    info!("actions: Update requested");

    match flash.factory_slot() {
        Some(factory) => {
            if let Err(err) = SlotManager::new(flash).set_boot_slot(&factory.label) {
                error!("actions: {}, restarting into the current image", err);
            }
        }
        None => {
            error!("actions: {}, restarting into the current image", LifecycleError::FactorySlotMissing);
        }
    }

    if let Err(err) = state.set_post_reset_reason(PostResetReason::Update) {
        warn!("actions: Could not record post-reset reason: {}", err);
    }
    info!("actions: Restarting to apply update");
    system.restart();
    Ok(())
}

pub fn reset_pairing_and_reboot(
    state: &mut PersistentStateStore,
    system: &mut dyn System,
) -> Result<(), LifecycleError> {
    info!("actions: Clearing pairings");
    system
        .reset_pairing()
        .map_err(|cause| LifecycleError::Platform {
            op: "pairing reset",
            cause,
        })?;

    if let Err(err) = state.set_post_reset_reason(PostResetReason::Pairing) {
        warn!("actions: Could not record post-reset reason: {}", err);
    }
    system.restart();
    Ok(())
}
