//! Transport layer between a channel and its physical port.

use log::{debug, error, info};
use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::Duration;

use super::descriptor::DeviceDescriptor;
use crate::config::Config;
use crate::utils::error::TelemetryError;

/// Read half of an open port.
///
/// `read` waits at most one read timeout; returning `Ok(0)` means no bytes
/// arrived in that window. Any `Err` means the link is gone.
pub trait LinkReader: Send {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize>;
}

/// Write half of an open port.
pub trait LinkWriter: Send {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

pub struct Link {
    pub reader: Box<dyn LinkReader>,
    pub writer: Box<dyn LinkWriter>,
}

/// Opens links for descriptors. The seam where tests substitute a mock port.
pub trait Connector: Send + Sync {
    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Link, TelemetryError>;
}

pub struct SerialPortConnector {
    baud_rate: u32,
    timeout: Duration,
}

struct SerialReader(Box<dyn SerialPort>);

struct SerialWriter(Box<dyn SerialPort>);

impl SerialPortConnector {
    pub fn new(baud_rate: u32, timeout: Duration) -> Self {
        Self { baud_rate, timeout }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.baud_rate, config.read_timeout())
    }
}

impl Connector for SerialPortConnector {
    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Link, TelemetryError> {
        info!("🔌 Opening {} at {} baud", descriptor.port_path, self.baud_rate);

        let port = serialport::new(&descriptor.port_path, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(self.timeout)
            .open()
            .map_err(|e| {
                error!("❌ Failed to open serial port {}: {}", descriptor.port_path, e);
                TelemetryError::ConnectionError(format!("Failed to open {}: {}", descriptor.port_path, e))
            })?;

        // Drop whatever the device printed before we attached
        if let Err(e) = port.clear(ClearBuffer::All) {
            debug!("Could not clear buffers on {}: {}", descriptor.port_path, e);
        }

        let writer = port.try_clone().map_err(|e| {
            TelemetryError::ConnectionError(format!("Failed to clone {}: {}", descriptor.port_path, e))
        })?;

        Ok(Link {
            reader: Box::new(SerialReader(port)),
            writer: Box::new(SerialWriter(writer)),
        })
    }
}

impl LinkReader for SerialReader {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buffer) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl LinkWriter for SerialWriter {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.write_all(data)?;
        self.0.flush()
    }
}
