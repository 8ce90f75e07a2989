use std::collections::HashMap;
use tracing::debug;

/// Temperature the simulated sensor wanders around.
pub const DEFAULT_START_TEMP_CELSIUS: f32 = 22.0;

pub trait TemperatureSensor {
    /// Current reading in degrees Celsius.
    fn read_celsius(&mut self) -> f32;
}

/// Sensor with realistic-looking noise, for hosts without the hardware.
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    base: f32,
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        SimulatedSensor {
            base: DEFAULT_START_TEMP_CELSIUS,
        }
    }
}

impl TemperatureSensor for SimulatedSensor {
    fn read_celsius(&mut self) -> f32 {
        // drift slowly, stay within +/- 2.5 of the start temperature
        let step = rand::random::<f32>() * 0.5 - 0.25;
        self.base = (self.base + step).clamp(
            DEFAULT_START_TEMP_CELSIUS - 2.5,
            DEFAULT_START_TEMP_CELSIUS + 2.5,
        );
        self.base
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Led {
    Wifi,
    Error,
    Cloud,
}

pub trait StatusIndicator {
    fn set(&mut self, led: Led, on: bool);
    /// True while the cloud LED runs a blink pattern that must not be overridden.
    fn is_blinking(&self, led: Led) -> bool;
    /// Advance blink patterns; called once per loop iteration.
    fn sched(&mut self) {}
}

/// Indicator that logs state changes.
#[derive(Debug, Default)]
pub struct LogIndicator {
    state: HashMap<Led, bool>,
}

impl LogIndicator {
    pub fn is_on(&self, led: Led) -> bool {
        self.state.get(&led).copied().unwrap_or(false)
    }
}

impl StatusIndicator for LogIndicator {
    fn set(&mut self, led: Led, on: bool) {
        if self.state.insert(led, on) != Some(on) {
            debug!(?led, on, "Status indicator changed");
        }
    }

    fn is_blinking(&self, _led: Led) -> bool {
        false
    }
}
