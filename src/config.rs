//! Configuration
//!
//! Loaded once at startup from a TOML file. Every field has a default so a
//! minimal file only needs the link credentials and the transport endpoint.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use telemetry_shared::{link, mqtt, TransportMode};
use thiserror::Error;

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    pub link: LinkConfig,
    pub transport: TransportConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Device identity
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    /// Fixed tag prepended to the hardware address
    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,

    /// Interface whose MAC address identifies the device
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Explicit id, bypasses the MAC lookup
    #[serde(default)]
    pub id: Option<String>,
}

/// Link credentials and probing
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    #[serde(default = "default_interface")]
    pub interface: String,

    pub ssid: String,

    /// Empty for an open network
    #[serde(default)]
    pub password: String,

    /// Reachability target used to decide the link is up
    #[serde(default = "default_probe_address")]
    pub probe_address: String,

    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
}

/// Transport selection
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Mqtt,
    Http,
}

impl From<TransportKind> for TransportMode {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Mqtt => TransportMode::Persistent,
            TransportKind::Http => TransportMode::OneShot,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    pub mode: TransportKind,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Persistent session settings
#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    #[serde(default = "default_topic_namespace")]
    pub topic_namespace: String,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u16,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

/// One-shot delivery settings
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_http_url")]
    pub url: String,

    #[serde(default = "default_request_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClockConfig {
    #[serde(default = "default_sntp_server")]
    pub server: String,

    #[serde(default = "default_sntp_timeout_ms")]
    pub timeout_ms: u64,
}

/// Ranges for the simulated sensor
#[derive(Debug, Deserialize, Clone)]
pub struct SensorConfig {
    #[serde(default = "default_latitude_range")]
    pub latitude: [f64; 2],

    #[serde(default = "default_longitude_range")]
    pub longitude: [f64; 2],

    #[serde(default = "default_battery_range")]
    pub battery: [u8; 2],
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    #[serde(default = "default_establish_timeout_secs")]
    pub establish_timeout_secs: u64,
}

// Default value functions
fn default_id_prefix() -> String { "TC_".to_string() }
fn default_interface() -> String { "wlan0".to_string() }

fn default_probe_address() -> String { "1.1.1.1:53".to_string() }
fn default_attempt_timeout_ms() -> u64 { 5000 }
fn default_monitor_interval_ms() -> u64 { 30_000 }

fn default_broker_url() -> String { "mqtt://localhost:1883".to_string() }
fn default_topic_namespace() -> String { link::TOPIC_NAMESPACE.to_string() }
fn default_keep_alive_secs() -> u16 { 60 }
fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_reconnect_delay_ms() -> u64 { link::SESSION_RECONNECT_SECS * 1000 }

fn default_http_url() -> String { "http://localhost:8000/ingest".to_string() }
fn default_request_timeout_ms() -> u64 { 10_000 }

fn default_sntp_server() -> String { "pool.ntp.org:123".to_string() }
fn default_sntp_timeout_ms() -> u64 { 5000 }

fn default_latitude_range() -> [f64; 2] { [13.40, 13.90] }
fn default_longitude_range() -> [f64; 2] { [100.20, 101.00] }
fn default_battery_range() -> [u8; 2] { [10, 100] }

fn default_interval_secs() -> u64 { link::TELEMETRY_INTERVAL_SECS }
fn default_establish_timeout_secs() -> u64 { link::ESTABLISH_TIMEOUT_SECS }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id_prefix: default_id_prefix(),
            interface: default_interface(),
            id: None,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            topic_namespace: default_topic_namespace(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            username: None,
            password: None,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            url: default_http_url(),
            timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            server: default_sntp_server(),
            timeout_ms: default_sntp_timeout_ms(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            latitude: default_latitude_range(),
            longitude: default_longitude_range(),
            battery: default_battery_range(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            establish_timeout_secs: default_establish_timeout_secs(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.link.ssid.trim().is_empty() {
            return Err(invalid("link.ssid must not be empty"));
        }
        if self.link.attempt_timeout_ms == 0 || self.link.monitor_interval_ms == 0 {
            return Err(invalid("link timeouts must be greater than zero"));
        }
        if self.device.id.is_none() && self.device.interface.trim().is_empty() {
            return Err(invalid("device.interface is required when device.id is unset"));
        }
        if self.telemetry.interval_secs == 0 {
            return Err(invalid("telemetry.interval_secs must be greater than zero"));
        }
        if self.supervisor.establish_timeout_secs == 0 {
            return Err(invalid("supervisor.establish_timeout_secs must be greater than zero"));
        }
        if self.clock.timeout_ms == 0 {
            return Err(invalid("clock.timeout_ms must be greater than zero"));
        }

        let [lat_min, lat_max] = self.sensor.latitude;
        let [lon_min, lon_max] = self.sensor.longitude;
        let [bat_min, bat_max] = self.sensor.battery;
        if !(-90.0..=90.0).contains(&lat_min) || !(-90.0..=90.0).contains(&lat_max) || lat_min >= lat_max {
            return Err(invalid("sensor.latitude must be an increasing range within -90..=90"));
        }
        if !(-180.0..=180.0).contains(&lon_min) || !(-180.0..=180.0).contains(&lon_max) || lon_min >= lon_max {
            return Err(invalid("sensor.longitude must be an increasing range within -180..=180"));
        }
        if bat_min >= bat_max || bat_max > 100 {
            return Err(invalid("sensor.battery must be an increasing range within 0..=100"));
        }

        match self.transport.mode {
            TransportKind::Mqtt => {
                let mqtt = &self.transport.mqtt;
                mqtt::parse_broker_url(&mqtt.broker_url)
                    .map_err(|e| invalid(&format!("transport.mqtt.broker_url: {e}")))?;
                if mqtt.topic_namespace.is_empty() {
                    return Err(invalid("transport.mqtt.topic_namespace must not be empty"));
                }
                if mqtt.keep_alive_secs == 0 || mqtt.connect_timeout_ms == 0 || mqtt.reconnect_delay_ms == 0 {
                    return Err(invalid("transport.mqtt timings must be greater than zero"));
                }
            }
            TransportKind::Http => {
                let http = &self.transport.http;
                if !(http.url.starts_with("http://") || http.url.starts_with("https://")) {
                    return Err(invalid("transport.http.url must start with http:// or https://"));
                }
                if http.timeout_ms == 0 {
                    return Err(invalid("transport.http.timeout_ms must be greater than zero"));
                }
            }
        }

        Ok(())
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.interval_secs)
    }

    pub fn establish_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor.establish_timeout_secs)
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}
