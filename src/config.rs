//! Configuration using Figment
//!
//! Settings are layered from three sources, later ones overriding earlier ones:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A TOML file (`config/datalog.toml` unless another path is given)
//! 3. Environment variables prefixed with `DATALOG_`, nested keys separated by
//!    a double underscore
//!
//! # Example
//! ```no_run
//! use datalog::config::Settings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // DATALOG_SERVER__PORT=9000 overrides [server] port
//! let settings = Settings::load()?;
//! println!("Listening on {}:{}", settings.server.host, settings.server.port);
//! # Ok(())
//! # }
//! ```

use crate::adc::hrdl::constants::{Channel, ConversionTime, InputType, VoltageRange};
use crate::adc::AdcKind;
use crate::data::MAX_AMOUNT;
use crate::error::{AppResult, DaqError};
use crate::network::protocol::DataFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/datalog.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "DATALOG_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Network server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// ADC unit selection
    #[serde(default)]
    pub adc: AdcConfig,
    /// Device acquisition settings
    #[serde(default)]
    pub device: DeviceConfig,
    /// Poll loop settings
    #[serde(default)]
    pub fetch: FetchConfig,
    /// In-memory store settings
    #[serde(default)]
    pub datastore: DataStoreConfig,
    /// Optional CSV file every stored reading is appended to
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Network server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port (0 picks a free port)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum concurrent clients
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Readings returned when a request names no amount
    #[serde(default = "default_readings_per_request")]
    pub default_readings_per_request: i64,
    /// Upper bound on readings per request
    #[serde(default = "max_readings_per_request")]
    pub max_readings_per_request: i64,
    /// Body format when a request names none
    #[serde(default)]
    pub default_format: DataFormat,
    /// Idle time after which a client is disconnected, in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

/// ADC unit selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdcConfig {
    /// Unit type
    #[serde(default)]
    pub kind: AdcKind,
    /// Attempts made to open the unit before giving up
    #[serde(default = "default_open_attempts")]
    pub open_attempts: u32,
    /// Base delay between open attempts, in ms (grows quadratically)
    #[serde(default = "default_reopen_delay")]
    pub reopen_delay_ms: u64,
}

/// Unit in which the device wrapper emits sample values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputUnit {
    /// Raw ADC counts
    #[default]
    Counts,
    /// Volts, using the unit's calibration factor
    Volts,
}

/// One enabled analog input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel number, 1 to 16
    pub number: Channel,
    /// Input voltage range
    #[serde(default)]
    pub range: VoltageRange,
    /// Single ended or differential
    #[serde(default)]
    pub input_type: InputType,
}

impl ChannelConfig {
    /// Single ended channel on the widest range.
    pub fn new(number: Channel) -> Self {
        Self {
            number,
            range: VoltageRange::default(),
            input_type: InputType::default(),
        }
    }
}

/// Device acquisition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Values collected from the unit per poll, shared across channels
    #[serde(default = "default_sample_buf_len")]
    pub sample_buf_len: usize,
    /// Time to sample every enabled channel, in ms
    #[serde(default = "default_sample_time")]
    pub sample_time_ms: u32,
    /// Per-channel conversion time
    #[serde(default = "default_conversion_time")]
    pub conversion_time: ConversionTime,
    /// Unit of emitted samples
    #[serde(default)]
    pub output_unit: OutputUnit,
    /// Enabled channels
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
}

impl DeviceConfig {
    /// Enabled channel numbers, ascending.
    pub fn channel_numbers(&self) -> Vec<u8> {
        let mut numbers: Vec<u8> = self.channels.iter().map(|c| c.number.number()).collect();
        numbers.sort_unstable();
        numbers
    }
}

/// Poll loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Time between device polls, in ms
    #[serde(default = "default_poll_time")]
    pub poll_time_ms: u64,
}

/// In-memory store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataStoreConfig {
    /// Readings retained before the oldest are dropped
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

// Default value functions
fn default_name() -> String {
    "datalog".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> usize {
    5
}

fn default_readings_per_request() -> i64 {
    100
}

fn max_readings_per_request() -> i64 {
    MAX_AMOUNT
}

fn default_read_timeout() -> u64 {
    300
}

fn default_open_attempts() -> u32 {
    5
}

fn default_reopen_delay() -> u64 {
    1000
}

fn default_sample_buf_len() -> usize {
    1000
}

fn default_sample_time() -> u32 {
    1000
}

fn default_conversion_time() -> ConversionTime {
    ConversionTime::Time660ms
}

fn default_channels() -> Vec<ChannelConfig> {
    Channel::new(1).map(ChannelConfig::new).into_iter().collect()
}

fn default_poll_time() -> u64 {
    10_000
}

fn default_max_size() -> usize {
    crate::data::DEFAULT_SIZE
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            default_readings_per_request: default_readings_per_request(),
            max_readings_per_request: max_readings_per_request(),
            default_format: DataFormat::default(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            kind: AdcKind::default(),
            open_attempts: default_open_attempts(),
            reopen_delay_ms: default_reopen_delay(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sample_buf_len: default_sample_buf_len(),
            sample_time_ms: default_sample_time(),
            conversion_time: default_conversion_time(),
            output_unit: OutputUnit::default(),
            channels: default_channels(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            poll_time_ms: default_poll_time(),
        }
    }
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
        }
    }
}

impl Settings {
    /// Load configuration from `config/datalog.toml` and environment variables
    ///
    /// A missing file is not an error; the defaults apply.
    /// Example override: `DATALOG_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path, then validate it
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Self::figment(path.as_ref()).extract()?;
        settings.validate().map_err(DaqError::Configuration)?;
        Ok(settings)
    }

    /// The provider chain used by [`Settings::load_from`]
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        // Validate log level
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

        if self.server.max_connections == 0 {
            return Err("server.max_connections must be at least 1".to_string());
        }

        if !(1..=MAX_AMOUNT).contains(&self.server.max_readings_per_request) {
            return Err(format!(
                "Invalid max_readings_per_request {}. Must be 1-{}",
                self.server.max_readings_per_request, MAX_AMOUNT
            ));
        }

        if self.server.default_readings_per_request < 0
            || self.server.default_readings_per_request > self.server.max_readings_per_request
        {
            return Err(format!(
                "Invalid default_readings_per_request {}. Must be 0-{}",
                self.server.default_readings_per_request, self.server.max_readings_per_request
            ));
        }

        if self.adc.open_attempts == 0 {
            return Err("adc.open_attempts must be at least 1".to_string());
        }

        if self.device.channels.is_empty() {
            return Err("At least one device channel must be enabled".to_string());
        }

        // Channels are unique
        let mut numbers = HashSet::new();
        for channel in &self.device.channels {
            if !numbers.insert(channel.number) {
                return Err(format!("Duplicate channel: {}", channel.number));
            }
        }

        if self.device.sample_time_ms == 0 || self.device.sample_time_ms > 16_000 {
            return Err(format!(
                "Invalid sample_time_ms {}. Must be 1-16000",
                self.device.sample_time_ms
            ));
        }

        // Every channel must convert within one sample interval
        let budget =
            self.device.channels.len() as u64 * u64::from(self.device.conversion_time.millis());
        if budget > u64::from(self.device.sample_time_ms) {
            return Err(format!(
                "{} channels at {} ms conversion need {} ms, more than sample_time_ms {}",
                self.device.channels.len(),
                self.device.conversion_time.millis(),
                budget,
                self.device.sample_time_ms
            ));
        }

        if self.device.sample_buf_len < self.device.channels.len() {
            return Err(format!(
                "sample_buf_len {} is smaller than the {} enabled channels",
                self.device.sample_buf_len,
                self.device.channels.len()
            ));
        }

        if self.fetch.poll_time_ms == 0 {
            return Err("fetch.poll_time_ms must be at least 1".to_string());
        }

        if self.datastore.max_size == 0 {
            return Err("datastore.max_size must be at least 1".to_string());
        }

        Ok(())
    }

    /// Address the server binds, `host:port`.
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// The effective settings as a TOML document, loadable with
    /// [`Settings::load_from`].
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Serialization(e.to_string()))
    }
}
