use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use esp_idf_hal::modem::Modem;
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use log::*;
use tokio::sync::oneshot;

use esp32_lifecycle::config::LifecycleConfig;
use esp32_lifecycle::restart::BootDecision;
use esp32_lifecycle::state::PersistentStateStore;
use esp32_lifecycle::tasks::{spawn_factory_reset, Device, StableWindowTimer, UpdateWorker};

mod button;
mod http;
mod nvs;
mod partitions;
mod system;

use http::EspHttp;
use nvs::EspKv;
use partitions::EspPartitions;
use system::EspSystem;

const CONFIG: &str = include_str!("../lifecycle.ron");

const WIFI_SSID: Option<&str> = option_env!("WIFI_SSID");
const WIFI_PASS: Option<&str> = option_env!("WIFI_PASS");

fn connect_wifi(modem: Modem, sysloop: EspSystemEventLoop, ssid: &str) -> Result<BlockingWifi<EspWifi<'static>>> {
    let password = WIFI_PASS.unwrap_or("");
    let mut wifi = BlockingWifi::wrap(EspWifi::new(modem, sysloop.clone(), None)?, sysloop)?;

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: password.try_into().map_err(|_| anyhow!("wifi password too long"))?,
        auth_method: if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        },
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("Connecting to {}...", ssid);
    wifi.connect()?;
    wifi.wait_netif_up()?;
    info!("WiFi up: {:?}", wifi.wifi().sta_netif().get_ip_info()?);
    Ok(wifi)
}

fn main() -> Result<()> {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("Lifecycle firmware {} starting", env!("CARGO_PKG_VERSION"));
    let config = LifecycleConfig::from_ron(CONFIG).context("Embedded lifecycle.ron is invalid")?;

    let mut device = Device {
        flash: Box::new(EspPartitions::new()?),
        state: PersistentStateStore::new(Box::new(EspKv::new())),
        http: Box::new(EspHttp::new()),
        system: Box::new(EspSystem),
    };
    let report = device.boot(&config.restart)?;
    let device = device.shared();

    let _stable = match report.decision {
        BootDecision::ThresholdReached { count } => {
            warn!("{} rapid power cycles, factory reset", count);
            let worker = spawn_factory_reset(device, config.restart.countdown_secs)?;
            match worker.join() {
                Ok(Ok(erased)) => info!("Factory reset returned: {:?}", erased),
                Ok(Err(err)) => error!("Factory reset failed: {}", err),
                Err(_) => error!("Factory reset worker panicked"),
            }
            return Ok(());
        }
        BootDecision::Counting { stable_window, .. } => {
            Some(StableWindowTimer::arm(device.clone(), &config.restart, stable_window)?)
        }
        BootDecision::Idle => None,
    };

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;

    let _button = button::spawn(peripherals.pins.gpio0, device.clone(), config.buttons.clone())?;

    let (online, waiter) = oneshot::channel();
    let _updates = UpdateWorker::spawn(device.clone(), config.update.clone(), waiter)?;

    let _wifi = match WIFI_SSID {
        Some(ssid) => match connect_wifi(peripherals.modem, sysloop, ssid) {
            Ok(wifi) => {
                let _ = online.send(());
                Some(wifi)
            }
            Err(err) => {
                error!("WiFi failed, no update checks this boot: {:#}", err);
                drop(online);
                None
            }
        },
        None => {
            warn!("Built without WIFI_SSID, no update checks");
            drop(online);
            None
        }
    };

    loop {
        thread::sleep(Duration::from_secs(1));
    }
}
