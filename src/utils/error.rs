use thiserror::Error;

use crate::devices::ChannelState;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Discovery error: {0}")]
    DiscoveryError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("Channel {device_id} is not open (state: {state})")]
    ChannelUnavailable {
        device_id: String,
        state: ChannelState,
    },

    #[error("Line buffer overflow on {device_id}: no terminator within {limit} bytes")]
    BufferOverflow { device_id: String, limit: usize },

    #[error("Callback error: {0}")]
    CallbackError(String),

    #[error("Sink I/O error: {0}")]
    SinkIoError(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("No device channel could be created")]
    NoChannels,

    #[error("Timeout occurred")]
    Timeout,
}

impl From<serde_json::Error> for TelemetryError {
    fn from(err: serde_json::Error) -> Self {
        TelemetryError::SerializationError(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for TelemetryError {
    fn from(err: std::io::Error) -> Self {
        TelemetryError::CommunicationError(format!("IO error: {}", err))
    }
}

impl From<serialport::Error> for TelemetryError {
    fn from(err: serialport::Error) -> Self {
        TelemetryError::ConnectionError(format!("Serial port error: {}", err))
    }
}

impl From<toml::de::Error> for TelemetryError {
    fn from(err: toml::de::Error) -> Self {
        TelemetryError::ConfigError(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for TelemetryError {
    fn from(err: toml::ser::Error) -> Self {
        TelemetryError::ConfigError(format!("TOML write error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for TelemetryError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TelemetryError::Timeout
    }
}
