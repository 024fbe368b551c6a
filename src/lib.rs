//! Multi-device USB-serial telemetry acquisition
//!
//! Discovers known USB-serial devices, keeps a resilient read channel per
//! device, normalizes their text reports into typed samples and fans those
//! out to consumers such as the console display, the history monitor and
//! the record logger.

pub mod cli;
pub mod config;
pub mod devices;
pub mod output;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use devices::{ChannelState, DeviceChannel, DeviceCommand, DeviceDescriptor, FieldValue, ParseOutcome, Sample};
pub use output::{ConsoleDisplay, RecordLogger, SinkHandle};
pub use services::{DeviceEvent, DeviceManager, Dispatcher, EventHandler, HistoryMonitor};
pub use utils::error::TelemetryError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
