use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serialport::{SerialPortInfo, SerialPortType};

use crate::config::{Config, KnownDevice};
use crate::utils::error::TelemetryError;

/// A serial endpoint as reported by the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratedPort {
    pub port_path: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// Identity of one candidate device, produced by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub port_path: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub device_id: String,
    pub manufacturer: Option<String>,
}

/// The accepted (vendor_id, product_id) pairs.
#[derive(Debug, Clone, Default)]
pub struct IdentityTable {
    entries: Vec<KnownDevice>,
}

pub trait PortEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<EnumeratedPort>, TelemetryError>;
}

/// Enumerates the host's serial ports through `serialport`.
pub struct SystemPortEnumerator;

impl EnumeratedPort {
    pub fn from_port_info(info: &SerialPortInfo) -> Self {
        match &info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                port_path: info.port_name.clone(),
                vendor_id: Some(usb.vid),
                product_id: Some(usb.pid),
                manufacturer: usb.manufacturer.clone(),
                product: usb.product.clone(),
                serial_number: usb.serial_number.clone(),
            },
            _ => Self {
                port_path: info.port_name.clone(),
                vendor_id: None,
                product_id: None,
                manufacturer: None,
                product: None,
                serial_number: None,
            },
        }
    }
}

impl PortEnumerator for SystemPortEnumerator {
    fn enumerate(&self) -> Result<Vec<EnumeratedPort>, TelemetryError> {
        let ports = serialport::available_ports()
            .map_err(|e| TelemetryError::DiscoveryError(format!("Port enumeration failed: {}", e)))?;
        debug!("Enumerated {} serial ports", ports.len());
        Ok(ports.iter().map(EnumeratedPort::from_port_info).collect())
    }
}

impl IdentityTable {
    pub fn new(entries: Vec<KnownDevice>) -> Self {
        Self { entries }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.known_devices.clone())
    }

    pub fn contains(&self, vendor_id: u16, product_id: u16) -> bool {
        self.entries
            .iter()
            .any(|d| d.vendor_id == vendor_id && d.product_id == product_id)
    }

    pub fn label_for(&self, vendor_id: u16, product_id: u16) -> Option<&str> {
        self.entries
            .iter()
            .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
            .map(|d| d.label.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DeviceDescriptor {
    /// Descriptor for a port given explicitly rather than discovered.
    pub fn for_port(port_path: &str, device_id: Option<&str>) -> Self {
        Self {
            port_path: port_path.to_string(),
            vendor_id: None,
            product_id: None,
            device_id: device_id
                .map(str::to_string)
                .unwrap_or_else(|| device_id_from_port(port_path)),
            manufacturer: None,
        }
    }
}

/// Stable device id derived from a port path: `/dev/cu.usbserial-0001` -> `usbserial-0001`.
pub fn device_id_from_port(port_path: &str) -> String {
    let name = port_path
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(port_path);
    let name = name.strip_prefix("tty.").unwrap_or(name);
    let name = name.strip_prefix("cu.").unwrap_or(name);
    if name.is_empty() {
        port_path.to_string()
    } else {
        name.to_string()
    }
}

/// Keep the ports whose vid/pid pair is in the identity table, in enumeration order.
///
/// `config` supplies device id overrides; ports without one get an id derived
/// from their path.
pub fn match_ports(
    ports: &[EnumeratedPort],
    table: &IdentityTable,
    config: &Config,
) -> Vec<DeviceDescriptor> {
    ports
        .iter()
        .filter_map(|port| {
            let (vid, pid) = (port.vendor_id?, port.product_id?);
            if !table.contains(vid, pid) {
                return None;
            }
            let device_id = config
                .device_name_for(&port.port_path)
                .map(str::to_string)
                .unwrap_or_else(|| device_id_from_port(&port.port_path));
            debug!(
                "Matched {} ({:04X}:{:04X} {}) as {}",
                port.port_path,
                vid,
                pid,
                table.label_for(vid, pid).unwrap_or("known device"),
                device_id
            );
            Some(DeviceDescriptor {
                port_path: port.port_path.clone(),
                vendor_id: Some(vid),
                product_id: Some(pid),
                device_id,
                manufacturer: port.manufacturer.clone(),
            })
        })
        .collect()
}

/// Enumerate and match in one step. Enumeration failures yield an empty list.
pub fn discover(enumerator: &dyn PortEnumerator, table: &IdentityTable, config: &Config) -> Vec<DeviceDescriptor> {
    let ports = match enumerator.enumerate() {
        Ok(ports) => ports,
        Err(e) => {
            warn!("⚠️ {}", e);
            return Vec::new();
        }
    };

    let descriptors = match_ports(&ports, table, config);
    if descriptors.is_empty() {
        info!("🔍 No known devices among {} serial ports", ports.len());
    } else {
        info!("🔍 Found {} known devices among {} serial ports", descriptors.len(), ports.len());
    }
    descriptors
}
