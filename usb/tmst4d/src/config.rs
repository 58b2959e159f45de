use std::time::Duration;

use lazy_static::lazy_static;
use log::LevelFilter;
use serde::Deserialize;
use toml::Value;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub struct DeviceId {
    pub vendor: u16,
    pub product: u16,
}

impl DeviceId {
    pub const fn new(vendor: u16, product: u16) -> Self {
        Self { vendor, product }
    }
}

/// Tuning of the interrupt-rate servo. Intervals are in ticks scaled by 256.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub struct ServoConfig {
    /// Completions between two block size decisions.
    pub period: u32,
    /// Below this smoothed interval the block size doubles.
    pub fast_threshold: i32,
    /// Above this smoothed interval the block size halves.
    pub slow_threshold: i32,
    /// Upper clamp of the smoothed interval.
    pub ceiling: i32,
}

impl Default for ServoConfig {
    fn default() -> Self {
        DEFAULT_CONFIG.servo
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct DriverConfig {
    pub transfer_slots: usize,
    pub initial_chunk_order: u32,
    pub control_timeout_ms: u64,
    pub tick_us: u64,
    pub log_level: String,
    pub file_log_level: String,
    pub servo: ServoConfig,
    pub devices: Vec<DeviceId>,
}

impl DriverConfig {
    /// Parses a config file. Keys that are left out keep their built-in values.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        let mut config: Value = EMBEDDED_TOML.parse()?;
        merge(&mut config, text.parse()?);
        config.try_into()
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_micros(self.tick_us.max(1))
    }

    pub fn supports(&self, id: DeviceId) -> bool {
        self.devices.contains(&id)
    }

    pub fn output_level(&self) -> LevelFilter {
        common::logger::parse_level(&self.log_level).unwrap_or_else(common::logger::output_level)
    }

    pub fn file_level(&self) -> LevelFilter {
        common::logger::parse_level(&self.file_log_level).unwrap_or_else(common::logger::file_level)
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        DEFAULT_CONFIG.clone()
    }
}

/// Overlays `overrides` on `base`. Tables merge key by key, everything else is replaced.
fn merge(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Table(base), Value::Table(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overrides) => *base = overrides,
    }
}

const EMBEDDED_TOML: &str = include_str!("../config.toml");

lazy_static! {
    static ref DEFAULT_CONFIG: DriverConfig =
        toml::from_str(EMBEDDED_TOML).expect("Failed to parse internally embedded config file");
}
