//! Contract between transport managers and the application hosting them.
//!
//! A host routes inbound device messages, relays outbound broadcasts and
//! owns the durable device preferences. Transport managers only see the
//! narrow [`Host`] trait, so the same manager runs under the CLI, a test
//! harness or a long-lived service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Services a host provides to its transports.
pub trait Host: Send + Sync {
    /// Register a transport so it receives broadcasts and shutdown.
    fn register_client_transport(&self, transport_id: &str, transport: Arc<dyn ClientTransport>);

    /// Deliver one decoded inbound message into the host's router.
    fn submit_client_message(&self, transport_id: &str, client_id: &str, message: Value);

    /// Snapshot of the persisted device preferences.
    fn settings(&self) -> DeviceSettings;

    /// Apply a partial update to the persisted preferences.
    fn update_settings(&self, patch: SettingsPatch);
}

/// Callbacks a host invokes on a registered transport.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Host to device message relay.
    async fn on_broadcast(&self, kind: &str, message: &Value);

    /// Global shutdown notification.
    async fn on_shutdown(&self);
}

/// A Bluetooth Classic (SPP) device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassicDevice {
    /// Device address, or the bound serial device for OS-bound links.
    pub address: String,
    /// RFCOMM channel; looked up when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
    /// Friendly name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ClassicDevice {
    /// Device with an address only.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            channel: None,
            name: None,
        }
    }

    /// Set the RFCOMM channel.
    #[must_use]
    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Set the friendly name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A BLE peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleDevice {
    /// Platform peripheral id (a UUID on macOS, the address elsewhere).
    pub id: String,
    /// Hardware address, when the platform exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Advertised local name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl BleDevice {
    /// Device with an id only.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: None,
            name: None,
        }
    }
}

/// A device found by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Identifier to pass back to `connect`.
    pub id: String,
    /// Hardware address.
    pub address: String,
    /// Advertised or inquired name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Signal strength, BLE only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
}

/// Persisted device preferences, keyed as the host stores them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSettings {
    /// Last connected Classic device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bluetooth_device: Option<ClassicDevice>,
    /// Reconnect the Classic device automatically.
    #[serde(default)]
    pub bluetooth_auto_connect: bool,
    /// Last connected BLE device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ble_device: Option<BleDevice>,
    /// Reconnect the BLE device automatically.
    #[serde(default)]
    pub ble_auto_connect: bool,
}

impl DeviceSettings {
    /// Apply `patch` in place; absent fields are left untouched.
    pub fn apply(&mut self, patch: SettingsPatch) {
        if let Some(device) = patch.bluetooth_device {
            self.bluetooth_device = Some(device);
        }
        if let Some(flag) = patch.bluetooth_auto_connect {
            self.bluetooth_auto_connect = flag;
        }
        if let Some(device) = patch.ble_device {
            self.ble_device = Some(device);
        }
        if let Some(flag) = patch.ble_auto_connect {
            self.ble_auto_connect = flag;
        }
    }
}

/// Partial update of [`DeviceSettings`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    /// New Classic device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bluetooth_device: Option<ClassicDevice>,
    /// New Classic auto-connect flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bluetooth_auto_connect: Option<bool>,
    /// New BLE device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ble_device: Option<BleDevice>,
    /// New BLE auto-connect flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ble_auto_connect: Option<bool>,
}

impl SettingsPatch {
    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Strip everything but ASCII alphanumerics and prepend `prefix`.
pub(crate) fn derive_client_id(prefix: &str, address: &str) -> String {
    let mut id = String::with_capacity(prefix.len() + address.len());
    id.push_str(prefix);
    id.extend(address.chars().filter(char::is_ascii_alphanumeric));
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_use_host_key_names() {
        let settings = DeviceSettings {
            bluetooth_device: Some(ClassicDevice::new("AA:BB:CC:DD:EE:FF").with_channel(3)),
            bluetooth_auto_connect: true,
            ble_device: None,
            ble_auto_connect: false,
        };
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "bluetoothDevice": { "address": "AA:BB:CC:DD:EE:FF", "channel": 3 },
                "bluetoothAutoConnect": true,
                "bleAutoConnect": false,
            })
        );
        let back: DeviceSettings = serde_json::from_value(json).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn test_apply_patch_keeps_unset_fields() {
        let mut settings = DeviceSettings {
            bluetooth_auto_connect: true,
            ..Default::default()
        };
        settings.apply(SettingsPatch {
            ble_device: Some(BleDevice::new("peripheral-1")),
            ..Default::default()
        });
        assert!(settings.bluetooth_auto_connect);
        assert_eq!(settings.ble_device.unwrap().id, "peripheral-1");
    }

    #[test]
    fn test_empty_patch() {
        assert!(SettingsPatch::default().is_empty());
        let patch = SettingsPatch {
            ble_auto_connect: Some(false),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn test_client_id_strips_separators() {
        assert_eq!(derive_client_id("bt-", "AA:BB:CC:DD:EE:FF"), "bt-AABBCCDDEEFF");
        assert_eq!(derive_client_id("ble-", "c0-ff/ee 01"), "ble-c0ffee01");
    }
}
