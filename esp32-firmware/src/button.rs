//! The BOOT button on GPIO0, polled and classified into presses

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use esp_idf_hal::gpio::{Gpio0, PinDriver, Pull};
use log::{error, info};

use esp32_lifecycle::actions::{ButtonMap, ButtonPress};
use esp32_lifecycle::tasks::{handle_press, SharedDevice};

const POLL: Duration = Duration::from_millis(20);
const LONG_PRESS: Duration = Duration::from_secs(3);
const DOUBLE_GAP: Duration = Duration::from_millis(400);

#[derive(Default)]
struct PressDetector {
    pressed_at: Option<Instant>,
    /// Release time of a short press that may still become a double
    pending_single: Option<Instant>,
}

impl PressDetector {
    fn sample(&mut self, down: bool, now: Instant) -> Option<ButtonPress> {
        match (down, self.pressed_at) {
            (true, None) => {
                self.pressed_at = Some(now);
                None
            }
            (false, Some(pressed)) => {
                self.pressed_at = None;
                if now - pressed >= LONG_PRESS {
                    self.pending_single = None;
                    return Some(ButtonPress::Long);
                }
                if self.pending_single.take().is_some() {
                    return Some(ButtonPress::Double);
                }
                self.pending_single = Some(now);
                None
            }
            (false, None) => match self.pending_single {
                Some(released) if now - released > DOUBLE_GAP => {
                    self.pending_single = None;
                    Some(ButtonPress::Single)
                }
                _ => None,
            },
            (true, Some(_)) => None,
        }
    }
}

pub fn spawn(pin: Gpio0, device: SharedDevice, buttons: ButtonMap) -> Result<JoinHandle<()>> {
    let mut input = PinDriver::input(pin)?;
    input.set_pull(Pull::Up)?;

    let handle = thread::Builder::new()
        .name("lcm-button".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            let mut detector = PressDetector::default();
            loop {
                if let Some(press) = detector.sample(input.is_low(), Instant::now()) {
                    info!("button: {:?}", press);
                    if let Err(err) = handle_press(&device, &buttons, press) {
                        error!("button: {:?} press failed: {}", press, err);
                    }
                }
                thread::sleep(POLL);
            }
        })?;
    Ok(handle)
}
