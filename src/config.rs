//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `FIELD_DAQ_`, nested keys separated
//!    by a double underscore (`FIELD_DAQ_APPLICATION__LOG_LEVEL=debug`)
//!
//! Durations are written in humantime form (`"10s"`, `"250ms"`).
//!
//! # Example
//! ```toml
//! [application]
//! log_level = "info"
//!
//! [handler]
//! remote_serial_port = 8100
//!
//! [[sensors]]
//! device = "/dev/ttyS1"
//! id = 10
//! timeout = "5s"
//! serial = { baud = 9600, parity = "none", data_bits = 8, stop_bits = 1 }
//! message = { separator = "\\n", separator_at_eom = true }
//!
//! [[sensors.tags]]
//! id = 11
//! rate = 1.0
//! format = "%f,%f"
//! prompt = { string = "R\\r", rate = 1.0 }
//! variables = [{ name = "T", units = "degC" }, { name = "RH", units = "%" }]
//! ```

use chrono::{DateTime, Utc};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "FIELD_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaqConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Reactor settings
    #[serde(default)]
    pub handler: HandlerConfig,
    /// Sensor definitions
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Name used in the startup log line
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Reactor (sensor handler) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// TCP port of the remote-serial listener; absent disables the tunnel,
    /// 0 binds an ephemeral port.
    #[serde(default)]
    pub remote_serial_port: Option<u16>,
    /// Delay before a failed open is retried
    #[serde(default = "default_opener_retry", with = "humantime_serde")]
    pub opener_retry: Duration,
    /// Floor of the shared timeout-check interval
    #[serde(default = "default_min_check_interval", with = "humantime_serde")]
    pub min_check_interval: Duration,
    /// Upper bound on a single poll wait
    #[serde(default = "default_max_poll_wait", with = "humantime_serde")]
    pub max_poll_wait: Duration,
    /// Period of the statistics roll-up
    #[serde(default = "default_statistics_period", with = "humantime_serde")]
    pub statistics_period: Duration,
    /// Silence from every sensor for this long logs a "no data" message
    #[serde(default = "default_timeout_warning", with = "humantime_serde")]
    pub timeout_warning: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            remote_serial_port: None,
            opener_retry: default_opener_retry(),
            min_check_interval: default_min_check_interval(),
            max_poll_wait: default_max_poll_wait(),
            statistics_period: default_statistics_period(),
            timeout_warning: default_timeout_warning(),
        }
    }
}

/// Serial line parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::fmt::Display for Parity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Parity::None => "none",
            Parity::Odd => "odd",
            Parity::Even => "even",
        };
        write!(f, "{}", s)
    }
}

/// Serial port line settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialOptions {
    /// Baud rate
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Parity
    #[serde(default)]
    pub parity: Parity,
    /// Data bits (5-8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Stop bits (1-2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            baud: default_baud(),
            parity: Parity::None,
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
        }
    }
}

/// Message framing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageConfig {
    /// Separator, backslash sequences allowed (`"\\r\\n"`)
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Whether the separator ends (true) or begins (false) a message
    #[serde(default = "default_true")]
    pub separator_at_eom: bool,
    /// Fixed message length, not counting the separator; 0 for none
    #[serde(default)]
    pub length: usize,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            separator_at_eom: true,
            length: 0,
        }
    }
}

/// A prompt string sent at a fixed rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Bytes to send, backslash sequences allowed
    pub string: String,
    /// Prompts per second
    pub rate: f64,
    /// Phase offset within the period, seconds
    #[serde(default)]
    pub offset: f64,
}

/// Time-tag smoothing parameters of a sample tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothingConfig {
    /// Period over which the minimum time difference is tracked
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// A time difference over `gap` sample intervals restarts smoothing
    #[serde(default = "default_gap")]
    pub gap: f64,
}

/// One calibration record: coefficients valid from `time` onward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalEntryConfig {
    /// Start of validity (RFC 3339)
    pub time: DateTime<Utc>,
    /// Polynomial coefficients, constant term first
    pub coefs: Vec<f64>,
}

/// Value converter applied after scanning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConverterConfig {
    /// `y = intercept + slope * x`
    Linear {
        /// Slope
        #[serde(default = "default_slope")]
        slope: f64,
        /// Intercept
        #[serde(default)]
        intercept: f64,
    },
    /// `y = c0 + c1*x + c2*x^2 + ...`
    Polynomial {
        /// Coefficients, constant term first
        coefs: Vec<f64>,
    },
    /// Time-keyed polynomial coefficients, inline and/or from a file
    Calibration {
        /// Inline entries
        #[serde(default)]
        entries: Vec<CalEntryConfig>,
        /// File with one `<rfc3339-time> <c0> <c1> ...` record per line
        #[serde(default)]
        file: Option<PathBuf>,
    },
}

/// One variable of a sample tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableConfig {
    /// Variable name
    pub name: String,
    /// Units
    #[serde(default)]
    pub units: String,
    /// Value that marks missing data, replaced by NaN
    #[serde(default)]
    pub missing_value: Option<f64>,
    /// Lowest valid value
    #[serde(default)]
    pub min: Option<f64>,
    /// Highest valid value
    #[serde(default)]
    pub max: Option<f64>,
    /// Converter
    #[serde(default)]
    pub converter: Option<ConverterConfig>,
}

/// One sample tag of a sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleTagConfig {
    /// Id of the processed samples
    pub id: u32,
    /// Expected samples per second; 0 if irregular
    #[serde(default)]
    pub rate: f64,
    /// scanf-style format, backslash sequences allowed
    #[serde(default)]
    pub format: Option<String>,
    /// Prompt that solicits this tag's message
    #[serde(default)]
    pub prompt: Option<PromptConfig>,
    /// Time-tag smoothing
    #[serde(default)]
    pub smoothing: Option<SmoothingConfig>,
    /// Variables, in scan order
    #[serde(default)]
    pub variables: Vec<VariableConfig>,
}

/// One sensor definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Device name (serial path or `inet:`, `usock:`, `unix:`, `btspp:` form)
    pub device: String,
    /// Id of the raw samples
    pub id: u32,
    /// Read timeout; absent or zero disables timeout detection
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Transmission lag subtracted from processed time tags
    #[serde(default, with = "humantime_serde")]
    pub lag: Option<Duration>,
    /// String written right after each open, backslash sequences allowed
    #[serde(default)]
    pub init_string: Option<String>,
    /// Reopen (rather than just close) after a read error
    #[serde(default = "default_true")]
    pub reopen_on_io_error: bool,
    /// Serial line settings, ignored for sockets
    #[serde(default)]
    pub serial: SerialOptions,
    /// Framing
    #[serde(default)]
    pub message: MessageConfig,
    /// Sensor-level prompts
    #[serde(default)]
    pub prompts: Vec<PromptConfig>,
    /// Sample tags
    #[serde(default)]
    pub tags: Vec<SampleTagConfig>,
}

impl SensorConfig {
    /// Minimal sensor definition with default framing and no tags.
    pub fn new(device: impl Into<String>, id: u32) -> Self {
        Self {
            device: device.into(),
            id,
            timeout: None,
            lag: None,
            init_string: None,
            reopen_on_io_error: true,
            serial: SerialOptions::default(),
            message: MessageConfig::default(),
            prompts: Vec::new(),
            tags: Vec::new(),
        }
    }
}

fn default_app_name() -> String {
    "field-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_opener_retry() -> Duration {
    Duration::from_secs(10)
}

fn default_min_check_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_poll_wait() -> Duration {
    Duration::from_secs(1)
}

fn default_statistics_period() -> Duration {
    Duration::from_secs(10)
}

fn default_timeout_warning() -> Duration {
    Duration::from_secs(60)
}

fn default_baud() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_separator() -> String {
    "\\n".to_string()
}

fn default_true() -> bool {
    true
}

fn default_gap() -> f64 {
    1.5
}

fn default_slope() -> f64 {
    1.0
}

impl DaqConfig {
    /// Load from a TOML file plus `FIELD_DAQ_` environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Parse from TOML text without environment overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self, figment::Error> {
        Figment::from(Toml::string(toml)).extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.handler.min_check_interval.is_zero() {
            return Err("handler.min_check_interval must be greater than zero".to_string());
        }
        if self.handler.max_poll_wait.is_zero() {
            return Err("handler.max_poll_wait must be greater than zero".to_string());
        }

        let mut devices = HashSet::new();
        let mut ids = HashSet::new();
        for sensor in &self.sensors {
            if sensor.device.is_empty() {
                return Err(format!("Sensor id {} has an empty device name", sensor.id));
            }
            if !devices.insert(sensor.device.as_str()) {
                return Err(format!("Duplicate sensor device: {}", sensor.device));
            }
            if !ids.insert(sensor.id) {
                return Err(format!("Duplicate sample id: {}", sensor.id));
            }
            for tag in &sensor.tags {
                if !ids.insert(tag.id) {
                    return Err(format!(
                        "Duplicate sample id: {} (tag of {})",
                        tag.id, sensor.device
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[application]
name = "tower"
log_level = "debug"

[handler]
remote_serial_port = 8100
opener_retry = "5s"

[[sensors]]
device = "inet:localhost:4001"
id = 100
timeout = "2s"
lag = "15ms"
message = { separator = "\\r\\n", separator_at_eom = true }

[[sensors.tags]]
id = 101
rate = 2.0
format = "%f,%f"
variables = [
  { name = "T", units = "degC", min = -50.0, max = 60.0 },
  { name = "P", converter = { type = "linear", slope = 10.0, intercept = 1.0 } },
]
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = DaqConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.name, "tower");
        assert_eq!(config.application.log_format, "pretty");
        assert_eq!(config.handler.remote_serial_port, Some(8100));
        assert_eq!(config.handler.opener_retry, Duration::from_secs(5));
        assert_eq!(config.handler.statistics_period, Duration::from_secs(10));

        let sensor = &config.sensors[0];
        assert_eq!(sensor.timeout, Some(Duration::from_secs(2)));
        assert_eq!(sensor.lag, Some(Duration::from_millis(15)));
        assert!(sensor.reopen_on_io_error);
        assert_eq!(sensor.serial, SerialOptions::default());
        assert_eq!(sensor.message.separator, "\\r\\n");

        let tag = &sensor.tags[0];
        assert_eq!(tag.format.as_deref(), Some("%f,%f"));
        assert_eq!(tag.variables.len(), 2);
        assert_eq!(tag.variables[0].max, Some(60.0));
        assert_eq!(
            tag.variables[1].converter,
            Some(ConverterConfig::Linear {
                slope: 10.0,
                intercept: 1.0
            })
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = DaqConfig::load_from(file.path()).unwrap();
        assert_eq!(config.sensors.len(), 1);
    }

    #[test]
    fn test_empty_config_defaults() {
        let config = DaqConfig::from_toml_str("").unwrap();
        assert_eq!(config.application.log_level, "info");
        assert!(config.handler.remote_serial_port.is_none());
        assert!(config.sensors.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = DaqConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_devices_and_ids() {
        let mut config = DaqConfig::default();
        config.sensors.push(SensorConfig::new("/dev/ttyS1", 1));
        config.sensors.push(SensorConfig::new("/dev/ttyS1", 2));
        assert!(config.validate().unwrap_err().contains("Duplicate sensor device"));

        config.sensors[1].device = "/dev/ttyS2".to_string();
        config.sensors[1].id = 1;
        assert!(config.validate().unwrap_err().contains("Duplicate sample id"));
    }

    #[test]
    fn test_calibration_converter() {
        let text = r#"
[[sensors]]
device = "/dev/ttyS3"
id = 1

[[sensors.tags]]
id = 2
variables = [
  { name = "V", converter = { type = "calibration", entries = [
      { time = "2024-01-01T00:00:00Z", coefs = [0.0, 1.0] },
      { time = "2024-06-01T00:00:00Z", coefs = [0.5, 2.0] },
  ] } },
]
"#;
        let config = DaqConfig::from_toml_str(text).unwrap();
        match &config.sensors[0].tags[0].variables[0].converter {
            Some(ConverterConfig::Calibration { entries, file }) => {
                assert_eq!(entries.len(), 2);
                assert!(file.is_none());
            }
            other => panic!("unexpected converter {:?}", other),
        }
    }
}
