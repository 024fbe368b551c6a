//! Scriptable in-memory serial devices for testing channels and the manager.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::descriptor::{DeviceDescriptor, EnumeratedPort, PortEnumerator};
use super::transport::{Connector, Link, LinkReader, LinkWriter};
use crate::utils::error::TelemetryError;

// How long an idle mock read blocks, standing in for the port read timeout
const IDLE_READ: Duration = Duration::from_millis(2);

/// Handle on one simulated device. Clones share the same device.
#[derive(Clone, Default)]
pub struct MockDevice {
    inner: Arc<Mutex<MockDeviceInner>>,
}

#[derive(Default)]
struct MockDeviceInner {
    pending: VecDeque<u8>,
    written: Vec<u8>,
    unplugged: bool,
    generation: u64,
    fail_writes: bool,
    max_read: Option<usize>,
    open_count: usize,
}

/// Connector that hands out links to registered mock devices by port path.
#[derive(Default)]
pub struct MockConnector {
    devices: Mutex<HashMap<String, MockDevice>>,
}

/// Enumerator returning a fixed, replaceable port list.
#[derive(Default)]
pub struct MockEnumerator {
    ports: Mutex<Vec<EnumeratedPort>>,
}

struct MockReader {
    device: MockDevice,
    generation: u64,
}

struct MockWriter {
    device: MockDevice,
    generation: u64,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, MockDeviceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue raw bytes for the channel to read.
    pub fn push(&self, data: &[u8]) {
        self.inner().pending.extend(data);
    }

    pub fn push_line(&self, line: &str) {
        let mut inner = self.inner();
        inner.pending.extend(line.as_bytes());
        inner.pending.push_back(b'\n');
    }

    /// Simulate the cable being pulled: open links fail and reopening fails.
    pub fn unplug(&self) {
        let mut inner = self.inner();
        inner.unplugged = true;
        inner.generation += 1;
        inner.pending.clear();
    }

    pub fn plug_in(&self) {
        self.inner().unplugged = false;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.inner().fail_writes = fail;
    }

    /// Cap the bytes returned by a single read.
    pub fn set_max_read(&self, max: usize) {
        self.inner().max_read = Some(max.max(1));
    }

    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.inner().written).into_owned()
    }

    pub fn open_count(&self) -> usize {
        self.inner().open_count
    }

    pub fn pending_len(&self) -> usize {
        self.inner().pending.len()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device at `port_path` and return its handle.
    pub fn add(&self, port_path: &str) -> MockDevice {
        let device = MockDevice::new();
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(port_path.to_string(), device.clone());
        device
    }

    pub fn device(&self, port_path: &str) -> Option<MockDevice> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(port_path)
            .cloned()
    }
}

impl MockEnumerator {
    pub fn new(ports: Vec<EnumeratedPort>) -> Self {
        Self {
            ports: Mutex::new(ports),
        }
    }

    /// Convenience entry for a USB port with the given vid/pid.
    pub fn usb_port(port_path: &str, vendor_id: u16, product_id: u16) -> EnumeratedPort {
        EnumeratedPort {
            port_path: port_path.to_string(),
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    pub fn set_ports(&self, ports: Vec<EnumeratedPort>) {
        *self.ports.lock().unwrap_or_else(PoisonError::into_inner) = ports;
    }
}

impl PortEnumerator for MockEnumerator {
    fn enumerate(&self) -> Result<Vec<EnumeratedPort>, TelemetryError> {
        Ok(self.ports.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

impl Connector for MockConnector {
    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Link, TelemetryError> {
        let device = self.device(&descriptor.port_path).ok_or_else(|| {
            TelemetryError::ConnectionError(format!("No such port: {}", descriptor.port_path))
        })?;

        let generation = {
            let mut inner = device.inner();
            if inner.unplugged {
                return Err(TelemetryError::ConnectionError(format!(
                    "Port {} is unplugged",
                    descriptor.port_path
                )));
            }
            inner.open_count += 1;
            inner.generation
        };

        Ok(Link {
            reader: Box::new(MockReader {
                device: device.clone(),
                generation,
            }),
            writer: Box::new(MockWriter { device, generation }),
        })
    }
}

fn gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected")
}

impl LinkReader for MockReader {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        {
            let mut inner = self.device.inner();
            if inner.unplugged || inner.generation != self.generation {
                return Err(gone());
            }
            if !inner.pending.is_empty() {
                let limit = inner.max_read.unwrap_or(usize::MAX);
                let count = inner.pending.len().min(buffer.len()).min(limit);
                for (slot, byte) in buffer.iter_mut().zip(inner.pending.drain(..count)) {
                    *slot = byte;
                }
                return Ok(count);
            }
        }
        std::thread::sleep(IDLE_READ);
        Ok(0)
    }
}

impl LinkWriter for MockWriter {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut inner = self.device.inner();
        if inner.unplugged || inner.generation != self.generation {
            return Err(gone());
        }
        if inner.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "write failed"));
        }
        inner.written.extend_from_slice(data);
        Ok(())
    }
}
