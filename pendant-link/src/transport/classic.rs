//! Bluetooth Classic transport over the Serial Port Profile.
//!
//! The vendor SPP stack is reached through the narrow [`SppBackend`] trait;
//! [`ClassicDriver`] adds inquiry deduplication, channel lookup and client
//! id derivation on top, and plugs into the shared [`TransportManager`].

use super::host::{ClassicDevice, DeviceSettings, DiscoveredDevice, SettingsPatch, derive_client_id};
use super::manager::{Connection, Driver, TransportManager};
use crate::error::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use log::debug;
use std::time::Duration;

/// Transport id registered with the host.
pub const TRANSPORT_ID: &str = "bluetooth";

/// Upper bound on one inquiry.
pub const INQUIRY_TIMEOUT: Duration = Duration::from_secs(15);

/// Prefix of Classic client ids.
pub const CLIENT_PREFIX: &str = "bt-";

/// Operations used from an SPP stack.
#[async_trait]
pub trait SppBackend: Send + Sync + 'static {
    /// Whether the stack is usable on this host.
    async fn probe(&self) -> Result<bool>;

    /// Start an inquiry. The stream ends when the stack reports the inquiry
    /// finished; it may yield the same device more than once.
    async fn inquire(&self) -> Result<BoxStream<'static, DiscoveredDevice>>;

    /// Look up the SPP channel a device offers.
    async fn find_channel(&self, address: &str) -> Result<u8>;

    /// Open an SPP session on `channel`.
    async fn open(&self, address: &str, channel: u8) -> Result<Connection>;
}

/// [`Driver`] for Bluetooth Classic devices.
pub struct ClassicDriver<B> {
    backend: B,
}

impl<B: SppBackend> ClassicDriver<B> {
    /// Wrap an SPP backend.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

/// Classic transport manager.
pub type ClassicManager<B> = TransportManager<ClassicDriver<B>>;

#[async_trait]
impl<B: SppBackend> Driver for ClassicDriver<B> {
    type Target = ClassicDevice;
    const TRANSPORT_ID: &'static str = TRANSPORT_ID;

    async fn probe(&self) -> Result<bool> {
        self.backend.probe().await
    }

    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        let mut inquiry = self.backend.inquire().await?;
        let mut found: Vec<DiscoveredDevice> = Vec::new();

        let collect = async {
            while let Some(device) = inquiry.next().await {
                if found.iter().any(|d| d.address == device.address) {
                    continue;
                }
                debug!("[{TRANSPORT_ID}] Inquiry found {}", device.address);
                found.push(device);
            }
        };
        if tokio::time::timeout(duration.min(INQUIRY_TIMEOUT), collect)
            .await
            .is_err()
        {
            debug!("[{TRANSPORT_ID}] Inquiry timed out");
        }
        Ok(found)
    }

    async fn open(&self, target: &ClassicDevice) -> Result<(ClassicDevice, Connection)> {
        let channel = match target.channel {
            Some(channel) => channel,
            None => {
                let channel = self.backend.find_channel(&target.address).await?;
                debug!(
                    "[{TRANSPORT_ID}] {} offers SPP on channel {channel}",
                    target.address
                );
                channel
            },
        };
        let connection = self.backend.open(&target.address, channel).await?;
        let resolved = ClassicDevice {
            channel: Some(channel),
            ..target.clone()
        };
        Ok((resolved, connection))
    }

    fn client_id(&self, target: &ClassicDevice) -> String {
        derive_client_id(CLIENT_PREFIX, &target.address)
    }

    fn saved_target(&self, settings: &DeviceSettings) -> Option<ClassicDevice> {
        settings.bluetooth_device.clone()
    }

    fn auto_connect(&self, settings: &DeviceSettings) -> bool {
        settings.bluetooth_auto_connect
    }

    fn remember(&self, target: &ClassicDevice) -> SettingsPatch {
        SettingsPatch {
            bluetooth_device: Some(target.clone()),
            ..Default::default()
        }
    }
}
