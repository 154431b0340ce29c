//! Wireless device transports.
//!
//! A transport exchanges newline-delimited JSON with a pendant over
//! Bluetooth Classic (SPP) or BLE (Nordic UART Service). Both are a
//! [`TransportManager`] parameterised by a link [`Driver`]:
//!
//! - [`classic`]: SPP over an [`SppBackend`](classic::SppBackend)
//! - [`ble`]: NUS over a [`BleCentral`](ble::BleCentral)
//!
//! Concrete backends are feature gated: `native` provides
//! [`spp_serial::SerialSppBackend`] for OS-bound SPP ports, `ble` provides
//! [`btleplug_backend::BtleplugCentral`].

pub mod ble;
pub mod classic;
pub mod host;
pub mod manager;

#[cfg(feature = "ble")]
pub mod btleplug_backend;
#[cfg(feature = "native")]
pub mod spp_serial;

#[cfg(test)]
pub(crate) mod testing;

pub use ble::{BleDriver, BleManager};
pub use classic::{ClassicDriver, ClassicManager};
pub use host::{
    BleDevice, ClassicDevice, ClientTransport, DeviceSettings, DiscoveredDevice, Host,
    SettingsPatch,
};
pub use manager::{Connection, Driver, Link, Phase, RECONNECT_DELAY, Status, TransportManager};
