//! Boot a simulated device and run one update check against a real feed.
//!
//! ```text
//! RUST_LOG=debug lcm-sim [lifecycle.ron]
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};

use esp32_lifecycle::config::{LifecycleConfig, DEFAULT_CONFIG_PATH};
use esp32_lifecycle::factory_reset::FactoryReset;
use esp32_lifecycle::net::ReqwestHttp;
use esp32_lifecycle::ota::UpdateOutcome;
use esp32_lifecycle::platform::ResetReason;
use esp32_lifecycle::restart::BootDecision;
use esp32_lifecycle::sim::image::build_image;
use esp32_lifecycle::sim::{MemFlash, SimBoard};
use esp32_lifecycle::tasks::Device;

const FACTORY_VERSION: &str = "0.1.0";

fn load_config() -> Result<LifecycleConfig> {
    match std::env::args().nth(1) {
        Some(path) => LifecycleConfig::load_from(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => LifecycleConfig::load(),
        None => {
            warn!("No {} found, using defaults", DEFAULT_CONFIG_PATH);
            Ok(LifecycleConfig::default())
        }
    }
}

fn main() -> Result<()> {
    env_logger::try_init()?;
    let config = load_config()?;

    let flash = MemFlash::esp32_4mb();
    flash
        .flash_image("factory", &build_image(FACTORY_VERSION, &[0u8; 4096]))
        .context("Failed to program factory image")?;
    let board = SimBoard::new(flash, ResetReason::PowerOn, FACTORY_VERSION);

    let mut device = Device {
        flash: Box::new(board.flash.clone()),
        state: board.state(),
        http: Box::new(ReqwestHttp::new()?),
        system: Box::new(board.system.clone()),
    };

    let report = device.boot(&config.restart)?;
    info!("Boot: {:?}", report.decision);
    if let BootDecision::ThresholdReached { .. } = report.decision {
        let erased = FactoryReset::new(&mut *device.flash, &mut device.state, &mut *device.system)
            .run(config.restart.countdown_secs)?;
        info!("Factory reset: {:?}", erased);
        return Ok(());
    }

    match device.check_for_update(&config.update)? {
        UpdateOutcome::Installed { version, slot } => {
            let next = board.power_cycle(ResetReason::Software)?;
            info!("Installed {} into {}, simulated reboot runs {}", version, slot, next);
        }
        outcome => info!("Update check: {:?}", outcome),
    }
    Ok(())
}
