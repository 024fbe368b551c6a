use clap::ArgMatches;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::error::TelemetryError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Connection settings
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub read_chunk_bytes: usize,
    pub max_line_bytes: usize,

    // Discovery
    pub known_devices: Vec<KnownDevice>,
    pub ports: Vec<PortConfig>,
    pub device_names: HashMap<String, String>, // port_path -> device_id

    // Parsing: key alias -> canonical field name, on top of the built-in table
    pub field_aliases: HashMap<String, String>,

    // Channel supervision
    pub reconnect: ReconnectConfig,
    pub shutdown_timeout_ms: u64,

    // Consumers
    pub logging: LoggingConfig,
    pub history_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub port_path: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,        // fraction of the delay, 0.0..=1.0
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Jsonl,
    Csv,
    #[serde(alias = "text")]
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub output_dir: PathBuf,
    pub format: LogFormat,
    pub separate_devices: bool,
    pub max_file_size_mb: f64,
    pub rotate_interval_hours: Option<f64>,
    pub compress_rotated: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_retries: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            output_dir: PathBuf::from("logs"),
            format: LogFormat::Jsonl,
            separate_devices: false,
            max_file_size_mb: 100.0,
            rotate_interval_hours: None,
            compress_rotated: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            read_timeout_ms: 1000,
            read_chunk_bytes: 1024,
            max_line_bytes: 8192,
            known_devices: default_known_devices(),
            ports: Vec::new(),
            device_names: HashMap::new(),
            field_aliases: HashMap::new(),
            reconnect: ReconnectConfig::default(),
            shutdown_timeout_ms: 2000,
            logging: LoggingConfig::default(),
            history_size: 1000,
        }
    }
}

// USB-serial bridges commonly found on ESP32 boards
fn default_known_devices() -> Vec<KnownDevice> {
    [
        (0x10C4, 0xEA60, "Silicon Labs CP210x"),
        (0x1A86, 0x7523, "CH340"),
        (0x1A86, 0x55D4, "CH9102"),
        (0x303A, 0x1001, "ESP32-S2 native USB"),
        (0x303A, 0x0002, "ESP32-S3 native USB"),
        (0x0403, 0x6001, "FTDI FT232"),
        (0x0403, 0x6015, "FTDI FT231X"),
    ]
    .into_iter()
    .map(|(vendor_id, product_id, label)| KnownDevice {
        vendor_id,
        product_id,
        label: label.to_string(),
    })
    .collect()
}

impl LogFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            LogFormat::Jsonl => "jsonl",
            LogFormat::Csv => "csv",
            LogFormat::Log => "log",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jsonl" | "json" => Ok(LogFormat::Jsonl),
            "csv" => Ok(LogFormat::Csv),
            "log" | "text" | "txt" => Ok(LogFormat::Log),
            other => Err(TelemetryError::ConfigError(format!("Unknown log format: {}", other))),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TelemetryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TelemetryError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        info!("⚙️  Loaded configuration from {}", path.display());
        debug!("Configuration: {:?}", config);
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), TelemetryError> {
        // Create directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlay command line arguments on top of the loaded configuration.
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> Result<(), TelemetryError> {
        if let Some(baud) = matches.get_one::<String>("baud") {
            self.baud_rate = baud
                .parse()
                .map_err(|_| TelemetryError::ConfigError(format!("Invalid baud rate: {}", baud)))?;
        }

        if let Some(ports) = matches.get_many::<String>("port") {
            self.ports = ports
                .map(|p| PortConfig {
                    port_path: p.clone(),
                    device_id: None,
                })
                .collect();
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.baud_rate == 0 {
            return Err(TelemetryError::ConfigError("baud_rate must be positive".to_string()));
        }
        if self.read_timeout_ms == 0 {
            return Err(TelemetryError::ConfigError("read_timeout_ms must be positive".to_string()));
        }
        if self.max_line_bytes == 0 || self.read_chunk_bytes == 0 {
            return Err(TelemetryError::ConfigError(
                "max_line_bytes and read_chunk_bytes must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(TelemetryError::ConfigError("reconnect.jitter must be within 0..=1".to_string()));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(TelemetryError::ConfigError("reconnect.multiplier must be >= 1".to_string()));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    // Explicit device id for a port, if one has been assigned
    pub fn device_name_for(&self, port_path: &str) -> Option<&str> {
        self.ports
            .iter()
            .find(|p| p.port_path == port_path)
            .and_then(|p| p.device_id.as_deref())
            .or_else(|| self.device_names.get(port_path).map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_identity_table() {
        let config = Config::default();
        assert_eq!(config.known_devices.len(), 7);
        assert!(config
            .known_devices
            .iter()
            .any(|d| d.vendor_id == 0x10C4 && d.product_id == 0xEA60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            baud_rate = 921600

            [logging]
            enabled = true
            format = "csv"

            [device_names]
            "/dev/ttyUSB0" = "lab-bench"

            [field_aliases]
            temp = "temperature"
            "#,
        )
        .unwrap();

        assert_eq!(config.baud_rate, 921_600);
        assert_eq!(config.logging.format, LogFormat::Csv);
        assert!(config.logging.enabled);
        assert_eq!(config.reconnect.initial_delay_ms, 500);
        assert_eq!(config.device_name_for("/dev/ttyUSB0"), Some("lab-bench"));
        assert_eq!(config.device_name_for("/dev/ttyUSB1"), None);

        let aliases = crate::devices::parser::FieldAliases::with_overrides(&config.field_aliases);
        assert_eq!(aliases.canonical("TEMP"), "temperature");
        assert_eq!(aliases.canonical("latency"), "latency_avg");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("conf").join("telemetry.toml");

        let mut config = Config::default();
        config.ports.push(PortConfig {
            port_path: "/dev/ttyACM0".to_string(),
            device_id: Some("roof".to_string()),
        });
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.device_name_for("/dev/ttyACM0"), Some("roof"));
        assert_eq!(loaded.known_devices, config.known_devices);
    }

    #[test]
    fn test_invalid_jitter_rejected() {
        let mut config = Config::default();
        config.reconnect.jitter = 1.5;
        assert!(matches!(config.validate(), Err(TelemetryError::ConfigError(_))));
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("JSONL".parse::<LogFormat>().unwrap(), LogFormat::Jsonl);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Log);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
