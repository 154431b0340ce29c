//! Error types for pendant-link.

use std::io;
use thiserror::Error;

/// Result type for pendant-link operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for pendant-link operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (subprocess pipes, firmware files, sockets).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// BLE stack error.
    #[cfg(feature = "ble")]
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The transport backend is not usable on this host.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Operation requires `initialize()` first.
    #[error("Transport not initialized")]
    NotInitialized,

    /// The manager has been shut down.
    #[error("Transport is shutting down")]
    ShuttingDown,

    /// A scan is already running on this manager.
    #[error("A scan is already in progress")]
    ScanInProgress,

    /// The requested device could not be located.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The device does not expose the expected service.
    #[error("Device {0}")]
    UnsupportedDevice(String),

    /// Operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection-level failure.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A flash job ended with an error event.
    #[error("Flash failed: {0}")]
    Flash(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
