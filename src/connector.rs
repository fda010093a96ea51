//! Serial port discovery and opening.

use serialport::SerialPortType;
use tokio_serial::SerialPortBuilderExt;

use crate::serial_stream::SerialStream;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("No serial device matching {filter} found. Please connect a BitScope or specify the port manually")]
    DeviceNotFound { filter: DeviceFilter },
}

/// USB identity a port must have. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
}

impl DeviceFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_vid(mut self, vid: u16) -> Self {
        self.vid = Some(vid);
        self
    }

    pub fn with_pid(mut self, pid: u16) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    pub fn is_any(&self) -> bool {
        self.vid.is_none() && self.pid.is_none() && self.serial_number.is_none()
    }

    pub fn matches(&self, vid: u16, pid: u16, serial_number: Option<&str>) -> bool {
        self.vid.is_none_or(|v| v == vid)
            && self.pid.is_none_or(|p| p == pid)
            && self
                .serial_number
                .as_deref()
                .is_none_or(|s| Some(s) == serial_number)
    }

    fn matches_port(&self, port_type: &SerialPortType) -> bool {
        match port_type {
            SerialPortType::UsbPort(usb) => {
                self.matches(usb.vid, usb.pid, usb.serial_number.as_deref())
            }
            // Without USB identity a port can only satisfy an empty filter.
            _ => self.is_any(),
        }
    }
}

impl std::fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let field = |value: Option<String>| value.unwrap_or_else(|| "*".to_string());
        write!(
            f,
            "vid={} pid={} serial={}",
            field(self.vid.map(|v| format!("{v:04x}"))),
            field(self.pid.map(|p| format!("{p:04x}"))),
            field(self.serial_number.clone()),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitScopeDevice {
    pub port: String,
    pub serial_number: Option<String>,
}

pub struct Connector;

impl Connector {
    /// Ports whose USB identity satisfies `filter`, in enumeration order.
    pub fn devices_matching(filter: &DeviceFilter) -> Result<Vec<BitScopeDevice>, ConnectorError> {
        let ports = serialport::available_ports()?;
        let devices: Vec<BitScopeDevice> = ports
            .into_iter()
            .filter(|port| filter.matches_port(&port.port_type))
            .map(|port| BitScopeDevice {
                serial_number: match &port.port_type {
                    SerialPortType::UsbPort(usb) => usb.serial_number.clone(),
                    _ => None,
                },
                port: port.port_name,
            })
            .collect();
        log::debug!("{} serial devices match {}", devices.len(), filter);
        Ok(devices)
    }

    /// Open `port` as a non-blocking stream. Needs a running Tokio runtime.
    pub fn open_port(
        port: &str,
        settings: &SerialSettings,
    ) -> Result<SerialStream<tokio_serial::SerialStream>, ConnectorError> {
        log::debug!("Opening {} at {} baud", port, settings.baud_rate);
        let device = tokio_serial::new(port, settings.baud_rate)
            .open_native_async()
            .map_err(|e| {
                log::error!("Failed to open serial port {}: {}", port, e);
                e
            })?;
        Ok(SerialStream::new(device, port))
    }

    /// Open the first port matching `filter`.
    pub fn open_matching(
        filter: &DeviceFilter,
        settings: &SerialSettings,
    ) -> Result<SerialStream<tokio_serial::SerialStream>, ConnectorError> {
        let device = Self::devices_matching(filter)?
            .into_iter()
            .next()
            .ok_or_else(|| ConnectorError::DeviceNotFound {
                filter: filter.clone(),
            })?;
        Self::open_port(&device.port, settings)
    }
}
