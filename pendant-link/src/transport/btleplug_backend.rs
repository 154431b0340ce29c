//! [`BleCentral`] on top of `btleplug`.
//!
//! The first adapter reported by the platform manager is used. It is
//! created lazily on the first probe and kept for the life of the central.

use super::ble::{Advertisement, BleCentral, BleLink};
use crate::error::{Error, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, CharPropFlags, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use futures::future;
use futures::stream::BoxStream;
use log::{debug, info, warn};
use std::sync::Arc;
use uuid::Uuid;

/// Central backed by the platform BLE adapter.
#[derive(Default)]
pub struct BtleplugCentral {
    adapter: tokio::sync::Mutex<Option<Adapter>>,
}

impl BtleplugCentral {
    /// Central with no adapter opened yet.
    pub fn new() -> Self {
        Self::default()
    }

    async fn adapter(&self) -> Result<Adapter> {
        let mut slot = self.adapter.lock().await;
        if let Some(adapter) = slot.as_ref() {
            return Ok(adapter.clone());
        }
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Unavailable("no BLE adapter found".to_string()))?;
        match adapter.adapter_info().await {
            Ok(info) => info!("Using BLE adapter {info}"),
            Err(e) => debug!("Adapter info unavailable: {e}"),
        }
        *slot = Some(adapter.clone());
        Ok(adapter)
    }

    async fn advertisement(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
        let peripheral = adapter.peripheral(id).await.ok()?;
        let props = peripheral.properties().await.ok().flatten()?;
        Some(Advertisement {
            id: peripheral.id().to_string(),
            address: props.address.to_string(),
            name: props.local_name,
            rssi: props.rssi,
            services: props.services,
        })
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    async fn probe(&self) -> Result<bool> {
        match self.adapter().await {
            Ok(_) => Ok(true),
            Err(e) => {
                info!("BLE unavailable: {e}");
                Ok(false)
            },
        }
    }

    async fn scan(&self, services: &[Uuid]) -> Result<BoxStream<'static, Advertisement>> {
        let adapter = self.adapter().await?;
        let events = adapter.events().await?;

        // CoreBluetooth does not reliably filter on 128-bit service UUIDs;
        // scan unfiltered there and let the caller match advertisements.
        let filter = if cfg!(target_os = "macos") {
            ScanFilter::default()
        } else {
            ScanFilter {
                services: services.to_vec(),
            }
        };
        adapter.start_scan(filter).await?;

        let adverts = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => {
                        Self::advertisement(&adapter, &id).await
                    },
                    _ => None,
                }
            }
        });
        Ok(adverts.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        let adapter = self.adapter().await?;
        adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<Arc<dyn BleLink>> {
        let adapter = self.adapter().await?;
        let peripheral = adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await?;
        }
        Ok(Arc::new(BtleplugLink {
            adapter,
            peripheral,
        }))
    }
}

/// One connected peripheral.
struct BtleplugLink {
    adapter: Adapter,
    peripheral: Peripheral,
}

impl BtleplugLink {
    fn characteristic(&self, service: Uuid, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == uuid)
            .ok_or_else(|| Error::UnsupportedDevice(format!("has no characteristic {uuid}")))
    }
}

#[async_trait]
impl BleLink for BtleplugLink {
    async fn discover(&self) -> Result<Vec<(Uuid, Vec<Uuid>)>> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| {
                let characteristics = service.characteristics.iter().map(|c| c.uuid).collect();
                (service.uuid, characteristics)
            })
            .collect())
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<BoxStream<'static, Vec<u8>>> {
        let target = self.characteristic(service, characteristic)?;
        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&target).await?;

        // The notification stream outlives the link, so end it explicitly
        // when the adapter reports this peripheral gone.
        let id = self.peripheral.id();
        let gone = self
            .adapter
            .events()
            .await?
            .filter(move |event| {
                future::ready(matches!(event, CentralEvent::DeviceDisconnected(p) if *p == id))
            })
            .into_future();

        Ok(notifications
            .filter_map(move |n| future::ready((n.uuid == characteristic).then_some(n.value)))
            .take_until(gone)
            .boxed())
    }

    async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let target = self.characteristic(service, characteristic)?;
        let kind = if target.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        self.peripheral.write(&target, data, kind).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("Disconnect from {} failed: {e}", self.peripheral.id());
            return Err(e.into());
        }
        Ok(())
    }
}
