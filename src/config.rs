//! # Controller Configuration
//!
//! The controller is configured from a single TOML file. Every section is
//! optional; missing values fall back to the defaults below.
//!
//! ## Example
//!
//! ```toml
//! [controller]
//! device_name = "backyard-smoker"
//! display_unit = "fahrenheit"
//!
//! [control]
//! sample_period_ms = 1000
//! probe_timeout_ms = 400
//! setpoint = 110.0
//! fan_mode = "proportional"
//!
//! [control.gains]
//! kp = 4.0
//! ki = 0.02
//! kd = 1.0
//!
//! [[probes]]
//! label = "pit"
//! type = "resistance"
//! location = "D18"
//! offset = 1.5
//!
//! [[probes]]
//! label = "meat"
//! type = "analog-voltage"
//! location = "0x48:P0"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::fan::FanMode;
use crate::pid::PidGains;
use crate::probe::ProbeType;
use crate::units::TemperatureUnit;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub autotune: AutotuneConfig,
    #[serde(default)]
    pub probes: Vec<ProbeConfig>,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Identity and presentation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default)]
    pub display_unit: TemperatureUnit,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            display_unit: TemperatureUnit::default(),
        }
    }
}

/// Loop timing, PID and actuator settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    #[serde(default = "default_sample_period_ms")]
    pub sample_period_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Initial setpoint in °C. At or below `disarm_threshold` the loop idles.
    #[serde(default)]
    pub setpoint: f64,
    #[serde(default)]
    pub disarm_threshold: f64,
    #[serde(default)]
    pub gains: PidGains,
    #[serde(default)]
    pub output_min: f64,
    #[serde(default = "default_output_max")]
    pub output_max: f64,
    #[serde(default)]
    pub fan_mode: FanMode,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: default_sample_period_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            setpoint: 0.0,
            disarm_threshold: 0.0,
            gains: PidGains::default(),
            output_min: 0.0,
            output_max: default_output_max(),
            fan_mode: FanMode::default(),
        }
    }
}

impl ControlConfig {
    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_period_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Relay autotune budget and detection parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AutotuneConfig {
    /// Hysteresis around the target before the relay flips, °C.
    #[serde(default = "default_noise_band")]
    pub noise_band: f64,
    /// Peaks and valleys required before gains are computed.
    #[serde(default = "default_cycles")]
    pub cycles: usize,
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    #[serde(default = "default_max_consecutive_faults")]
    pub max_consecutive_faults: u32,
}

impl Default for AutotuneConfig {
    fn default() -> Self {
        Self {
            noise_band: default_noise_band(),
            cycles: default_cycles(),
            max_samples: default_max_samples(),
            max_duration_secs: default_max_duration_secs(),
            max_consecutive_faults: default_max_consecutive_faults(),
        }
    }
}

/// One physical probe.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    pub label: String,
    #[serde(rename = "type")]
    pub probe_type: ProbeType,
    pub location: String,
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Sample history and CSV export.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub csv_path: Option<String>,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            csv_path: None,
            history_capacity: default_history_capacity(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

/// Upper bound on simulated seconds per real second.
pub const MAX_TIME_SCALE: f64 = 1000.0;
/// Upper bound on simulated sensor noise, °C.
pub const MAX_SENSOR_NOISE: f64 = 100.0;

/// Thermal plant used when running without hardware.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    #[serde(default = "default_ambient")]
    pub ambient: f64,
    /// Peak heating rate with the fan fully on, °C/s.
    #[serde(default = "default_heat_rate")]
    pub heat_rate: f64,
    /// Newtonian loss coefficient, 1/s.
    #[serde(default = "default_loss_coefficient")]
    pub loss_coefficient: f64,
    #[serde(default)]
    pub sensor_noise: f64,
    /// Seconds of simulated time per real second.
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ambient: default_ambient(),
            heat_rate: default_heat_rate(),
            loss_coefficient: default_loss_coefficient(),
            sensor_noise: 0.0,
            time_scale: default_time_scale(),
        }
    }
}

impl Config {
    /// Validate cross-field constraints that serde can't express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let control = &self.control;
        if control.sample_period_ms == 0 {
            return Err(ConfigError::Invalid("control.sample_period_ms must be > 0".to_string()));
        }
        if control.probe_timeout_ms == 0 || control.probe_timeout_ms > control.sample_period_ms {
            return Err(ConfigError::Invalid(format!(
                "control.probe_timeout_ms must be in 1..={}",
                control.sample_period_ms
            )));
        }
        if !(control.output_min < control.output_max) {
            return Err(ConfigError::Invalid("control.output_min must be < control.output_max".to_string()));
        }
        if !control.gains.is_finite() {
            return Err(ConfigError::Invalid("control.gains must be finite".to_string()));
        }
        if !control.setpoint.is_finite() || !control.disarm_threshold.is_finite() {
            return Err(ConfigError::Invalid("control.setpoint must be finite".to_string()));
        }
        if self.autotune.cycles < 2 {
            return Err(ConfigError::Invalid("autotune.cycles must be >= 2".to_string()));
        }
        if self.autotune.noise_band < 0.0 {
            return Err(ConfigError::Invalid("autotune.noise_band must be >= 0".to_string()));
        }
        for probe in &self.probes {
            if probe.label.trim().is_empty() {
                return Err(ConfigError::Invalid("probe label cannot be empty".to_string()));
            }
            if !probe.offset.is_finite() {
                return Err(ConfigError::Invalid(format!("probe '{}' offset must be finite", probe.label)));
            }
        }
        if self.logging.level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::Invalid(format!("unknown logging.level '{}'", self.logging.level)));
        }
        if self.persistence.channel_capacity == 0 {
            return Err(ConfigError::Invalid("persistence.channel_capacity must be > 0".to_string()));
        }
        self.simulation.validate()
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("ambient", self.ambient),
            ("heat_rate", self.heat_rate),
            ("loss_coefficient", self.loss_coefficient),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::Invalid(format!("simulation.{} must be finite", name)));
            }
        }
        if !self.sensor_noise.is_finite() || self.sensor_noise < 0.0 || self.sensor_noise > MAX_SENSOR_NOISE {
            return Err(ConfigError::Invalid(format!(
                "simulation.sensor_noise must be in 0..={}",
                MAX_SENSOR_NOISE
            )));
        }
        if !(self.time_scale > 0.0 && self.time_scale <= MAX_TIME_SCALE) {
            return Err(ConfigError::Invalid(format!(
                "simulation.time_scale must be in (0, {}]",
                MAX_TIME_SCALE
            )));
        }
        Ok(())
    }
}

// Default value functions
fn default_device_name() -> String { "smokectl".to_string() }
fn default_sample_period_ms() -> u64 { 1000 }
fn default_probe_timeout_ms() -> u64 { 500 }
fn default_output_max() -> f64 { 100.0 }
fn default_noise_band() -> f64 { 0.5 }
fn default_cycles() -> usize { 4 }
fn default_max_samples() -> usize { 7200 }
fn default_max_duration_secs() -> u64 { 7200 }
fn default_max_consecutive_faults() -> u32 { 5 }
fn default_enabled() -> bool { true }
fn default_history_capacity() -> usize { 86_400 }
fn default_channel_capacity() -> usize { 1024 }
fn default_log_level() -> String { "info".to_string() }
fn default_ambient() -> f64 { 20.0 }
fn default_heat_rate() -> f64 { 2.0 }
fn default_loss_coefficient() -> f64 { 0.01 }
fn default_time_scale() -> f64 { 1.0 }

/// Load and validate configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    let config: Config = match toml::from_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to parse config TOML: {}", e);
            return Err(ConfigError::Toml(e));
        }
    };
    config.validate()?;
    Ok(config)
}
