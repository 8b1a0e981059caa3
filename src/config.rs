//! Configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (`AppConfig::default()`)
//! 2. A TOML file (`config/motion_daq.toml` unless told otherwise; missing is fine)
//! 3. Environment variables prefixed with `MOTION_DAQ_`, `__` separating sections
//!
//! # Example
//! ```no_run
//! use motion_daq::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // MOTION_DAQ_FILTER__WINDOW_SIZE_MS=300 overrides the file
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::time::Duration;

use crate::connection::LinkSettings;
use crate::control::{ControlRouting, ControlScale};
use crate::error::{AppResult, MotionError};
use crate::logging::{OutputFormat, VALID_LOG_LEVELS};
use crate::pipeline::{FilterBlueprint, FilterSettings, LeakySettings};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/motion_daq.toml";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "MOTION_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application identity and logging
    pub application: ApplicationConfig,
    /// Per-device filter
    pub filter: FilterConfig,
    /// Connection lifecycle timing
    pub link: LinkConfig,
    /// Control slot mapping
    pub control: ControlConfig,
    /// Devices attached at startup
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Name shown in logs
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Motion DAQ".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Which filter runs for each device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    /// Sliding-window mean of the acceleration magnitude
    Magnitude,
    /// Decaying trigger envelope
    LeakyIntegrator,
}

/// Per-device filter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Filter algorithm
    pub kind: FilterKind,
    /// Tick interval in milliseconds
    pub update_period_ms: u64,
    /// Magnitude filter only
    pub window_size_ms: u64,
    /// Leaky integrator only
    pub damping: f64,
    /// Leaky integrator only
    pub resting_level: f64,
    /// Leaky integrator only
    pub trigger_threshold: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            kind: FilterKind::Magnitude,
            update_period_ms: 50,
            window_size_ms: 500,
            damping: 0.9,
            resting_level: 500.0,
            trigger_threshold: 500.0,
        }
    }
}

impl FilterConfig {
    /// Filter factory for these settings.
    pub fn blueprint(&self) -> FilterBlueprint {
        let update_period = Duration::from_millis(self.update_period_ms);
        match self.kind {
            FilterKind::Magnitude => FilterBlueprint::Magnitude(FilterSettings {
                update_period,
                window_size: Duration::from_millis(self.window_size_ms),
            }),
            FilterKind::LeakyIntegrator => FilterBlueprint::LeakyIntegrator(LeakySettings {
                update_period,
                damping: self.damping,
                resting_level: self.resting_level,
                trigger_threshold: self.trigger_threshold,
            }),
        }
    }
}

/// Link lifecycle timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Pause before reconnecting after a drop or failed attempt
    pub reconnect_backoff_ms: u64,
    /// Upper bound on a single command write or disconnect
    pub command_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_ms: 2000,
            command_timeout_ms: 5000,
        }
    }
}

impl LinkConfig {
    /// Settings handed to each connection manager.
    pub fn settings(&self) -> LinkSettings {
        LinkSettings {
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
        }
    }
}

/// Control output mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Filtered value mapped to 0.0
    pub offset: f64,
    /// Range above `offset` mapped to 1.0
    pub span: f64,
    /// Slot assignments
    #[serde(default)]
    pub routing: ControlRouting,
}

impl Default for ControlConfig {
    fn default() -> Self {
        let scale = ControlScale::default();
        Self {
            offset: scale.offset,
            span: scale.span,
            routing: ControlRouting::default(),
        }
    }
}

impl ControlConfig {
    /// Normalization for the control mapper.
    pub fn scale(&self) -> ControlScale {
        ControlScale {
            offset: self.offset,
            span: self.span,
        }
    }
}

/// Device attached at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Bluetooth address (or platform id) of the ring
    pub address: String,
    /// Display name, defaults to the address
    #[serde(default)]
    pub name: String,
    /// Skip this device when false
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl DeviceDefinition {
    /// Name for logs: `name`, or the address when unset.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.address
        } else {
            &self.name
        }
    }
}

fn default_enabled() -> bool {
    true
}

impl AppConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// The layered provider stack, for callers that want to merge more sources.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Semantic checks after loading
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(MotionError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.filter.update_period_ms == 0 {
            return Err(MotionError::Configuration(
                "filter.update_period_ms must be greater than 0".to_string(),
            ));
        }
        if self.filter.window_size_ms == 0 {
            return Err(MotionError::Configuration(
                "filter.window_size_ms must be greater than 0".to_string(),
            ));
        }
        if self.filter.damping.is_nan() || self.filter.damping <= 0.0 || self.filter.damping > 1.0 {
            return Err(MotionError::Configuration(format!(
                "filter.damping {} must be in (0, 1]",
                self.filter.damping
            )));
        }
        if self.control.span.is_nan() || self.control.span <= 0.0 {
            return Err(MotionError::Configuration(format!(
                "control.span {} must be positive",
                self.control.span
            )));
        }

        let mut addresses = std::collections::HashSet::new();
        for device in &self.devices {
            if device.address.trim().is_empty() {
                return Err(MotionError::Configuration(
                    "Device address cannot be empty".to_string(),
                ));
            }
            if !addresses.insert(device.address.trim()) {
                return Err(MotionError::Configuration(format!(
                    "Duplicate device address: {}",
                    device.address
                )));
            }
        }

        Ok(())
    }

    /// Devices to attach at startup
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceDefinition> {
        self.devices.iter().filter(|device| device.enabled)
    }
}
