//! Serial port discovery and classification.
//!
//! Enumeration support is probed once per process and cached: if the
//! platform cannot enumerate serial ports at all, every later call returns
//! an empty list instead of an error. Listing itself is not cached, so
//! hot-plugged boards show up on the next call.
//!
//! ## Supported bridges
//!
//! Pendant boards ship with one of these USB-to-UART bridges:
//! - Espressif native USB-Serial/JTAG (VID: 0x303A)
//! - Silicon Labs CP210x (VID: 0x10C4)
//! - WCH CH340/CH9102 (VID: 0x1A86)
//! - FTDI (VID: 0x0403)
//!
//! ## Example
//!
//! ```rust,no_run
//! use pendant_link::ports::{detect_ports, format_port_list};
//!
//! for line in format_port_list(&detect_ports()) {
//!     println!("{line}");
//! }
//! ```

use crate::error::{Error, Result};
use log::info;
use serde::Serialize;

#[cfg(feature = "native")]
use {
    log::{debug, trace, warn},
    std::sync::OnceLock,
};

/// USB bridges commonly found on ESP32 boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsbBridge {
    /// Espressif native USB-Serial/JTAG.
    Espressif,
    /// Silicon Labs CP210x.
    Cp210x,
    /// WCH CH340/CH341/CH9102.
    Ch340,
    /// FTDI FT232 family.
    Ftdi,
    /// Not a recognised bridge.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches any PID.
const KNOWN_BRIDGES: &[(u16, &[u16], UsbBridge)] = &[
    (0x303A, &[], UsbBridge::Espressif),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71], UsbBridge::Cp210x),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x55D3, 0x55D4],
        UsbBridge::Ch340,
    ),
    (0x0403, &[0x6001, 0x6010, 0x6014, 0x6015], UsbBridge::Ftdi),
];

impl UsbBridge {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_BRIDGES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && (pids.is_empty() || pids.contains(&pid)))
            .map_or(Self::Unknown, |(_, _, bridge)| *bridge)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Espressif => "Espressif USB",
            Self::Cp210x => "CP210x",
            Self::Ch340 => "CH340/CH9102",
            Self::Ftdi => "FTDI",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether this is a recognised bridge.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Bridges the pendant hardware actually uses; preferred by auto-detect.
    pub fn is_preferred(&self) -> bool {
        matches!(self, Self::Espressif | Self::Cp210x | Self::Ch340)
    }
}

/// A serial port with whatever USB metadata the platform exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedPort {
    /// Port path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub name: String,
    /// Bridge classification.
    pub bridge: UsbBridge,
    /// Bound to a Bluetooth SPP link rather than a USB device.
    pub bluetooth: bool,
    /// USB vendor id.
    pub vid: Option<u16>,
    /// USB product id.
    pub pid: Option<u16>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
    /// USB product string.
    pub product: Option<String>,
    /// USB serial number.
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Port with a name only.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bridge: UsbBridge::Unknown,
            bluetooth: false,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Whether the port is likely an ESP32 board.
    pub fn is_likely_esp32(&self) -> bool {
        self.bridge.is_known()
    }
}

#[cfg(feature = "native")]
static ENUMERATION: OnceLock<bool> = OnceLock::new();

/// Whether this host can enumerate serial ports. Probed once.
#[cfg(feature = "native")]
pub fn is_available() -> bool {
    *ENUMERATION.get_or_init(|| match serialport::available_ports() {
        Ok(ports) => {
            debug!("Serial enumeration available ({} ports)", ports.len());
            true
        },
        Err(e) => {
            warn!("Serial port enumeration unavailable: {e}");
            false
        },
    })
}

/// Whether this host can enumerate serial ports.
#[cfg(not(feature = "native"))]
pub fn is_available() -> bool {
    false
}

#[cfg(feature = "native")]
pub(crate) fn classify(info: serialport::SerialPortInfo) -> DetectedPort {
    let mut detected = DetectedPort::new(info.port_name);
    match info.port_type {
        serialport::SerialPortType::UsbPort(usb) => {
            detected.bridge = UsbBridge::from_vid_pid(usb.vid, usb.pid);
            trace!(
                "Found USB port: {} (VID: {:04X}, PID: {:04X}, {:?})",
                detected.name, usb.vid, usb.pid, detected.bridge
            );
            detected.vid = Some(usb.vid);
            detected.pid = Some(usb.pid);
            detected.manufacturer = usb.manufacturer;
            detected.product = usb.product;
            detected.serial = usb.serial_number;
        },
        serialport::SerialPortType::BluetoothPort => detected.bluetooth = true,
        _ => detected.bluetooth = detected.name.contains("rfcomm"),
    }
    detected
}

/// All serial ports, USB and Bluetooth-bound alike.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    if !is_available() {
        return Vec::new();
    }
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(classify).collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// All serial ports (always empty without the `native` feature).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Ports that look like ESP32 boards.
pub fn detect_esp32_ports() -> Vec<DetectedPort> {
    detect_ports()
        .into_iter()
        .filter(DetectedPort::is_likely_esp32)
        .collect()
}

/// Ports bound to Bluetooth SPP links.
pub fn detect_bluetooth_ports() -> Vec<DetectedPort> {
    detect_ports().into_iter().filter(|p| p.bluetooth).collect()
}

/// Pick the port to flash when none was given.
pub fn auto_detect_port() -> Result<DetectedPort> {
    select_port(detect_ports())
}

/// Preferred bridge first, then any recognised bridge.
fn select_port(mut ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    let chosen = ports
        .iter()
        .position(|p| p.bridge.is_preferred())
        .or_else(|| ports.iter().position(|p| p.bridge.is_known()));

    match chosen {
        Some(index) => {
            let port = ports.swap_remove(index);
            info!("Auto-detected {} on {}", port.bridge.name(), port.name);
            Ok(port)
        },
        None => Err(Error::DeviceNotFound(
            "no ESP32 serial port found".to_string(),
        )),
    }
}

/// One display line per port.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let kind = if port.bluetooth {
                " [Bluetooth]".to_string()
            } else if port.bridge.is_known() {
                format!(" [{}]", port.bridge.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };
            let product = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            format!("{}{kind}{product}", port.name)
        })
        .collect()
}
