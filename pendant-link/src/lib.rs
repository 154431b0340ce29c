//! # pendant-link
//!
//! Firmware provisioning and wireless transport for ESP32 CNC pendants.
//!
//! This crate provides:
//!
//! - USB firmware flashing through an external esptool binary
//! - OTA firmware upload to the device's `/update` endpoint
//! - Serial port discovery and ESP32 bridge classification
//! - Bluetooth Classic (SPP) and BLE (Nordic UART) transports that carry
//!   newline-delimited JSON between a host application and the pendant
//!
//! ## Features
//!
//! - `native` (default): serial port enumeration and OS-bound SPP links
//!   via the `serialport` crate
//! - `ble` (default): BLE central backend via `btleplug`
//!
//! ## Example
//!
//! ```rust,no_run
//! use pendant_link::flash::ota::{OtaFlashRequest, flash_ota};
//!
//! # async fn run() -> pendant_link::Result<()> {
//! let summary = flash_ota(OtaFlashRequest::new("firmware.bin", "192.168.4.1"))
//!     .wait(|event| println!("{event:?}"))
//!     .await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod flash;
pub mod framing;
pub mod ports;
pub mod transport;

pub use {
    error::{Error, Result},
    flash::{FlashEvent, FlashEvents, FlashState, ProgressSink},
    ports::{DetectedPort, UsbBridge, auto_detect_port, detect_esp32_ports, detect_ports},
};
