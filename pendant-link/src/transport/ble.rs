//! BLE transport over the Nordic UART Service (NUS).
//!
//! The host writes to the RX characteristic and receives notifications on
//! the TX characteristic. Writes are split into [`WRITE_CHUNK_SIZE`] pieces
//! to stay under the default ATT MTU.
//!
//! The vendor BLE stack is reached through two narrow traits:
//! [`BleCentral`] (scan, connect) and [`BleLink`] (GATT access on one
//! connected peripheral).

use super::host::{BleDevice, DeviceSettings, DiscoveredDevice, SettingsPatch, derive_client_id};
use super::manager::{Connection, Driver, Link, TransportManager};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Transport id registered with the host.
pub const TRANSPORT_ID: &str = "ble";

/// Nordic UART service.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Host to device characteristic (written).
pub const UART_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Device to host characteristic (notified).
pub const UART_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Default duration of a discovery scan.
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(10);

/// How long `connect` scans for the requested peripheral.
pub const LOCATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the link-layer connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest single GATT write.
pub const WRITE_CHUNK_SIZE: usize = 20;

/// Name fragment accepted for peripherals that omit the service UUID.
pub const NAME_HINT: &str = "pendant";

/// Environment variable that disables the BLE transport.
pub const DISABLE_ENV: &str = "PENDANT_DISABLE_BLE";

/// Prefix of BLE client ids.
pub const CLIENT_PREFIX: &str = "ble-";

/// Whether a value of [`DISABLE_ENV`] turns BLE off.
///
/// Unset, empty, `0` and `false` keep it enabled.
pub fn ble_disabled_by(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        None | Some("" | "0") => false,
        Some(v) => !v.eq_ignore_ascii_case("false"),
    }
}

/// One advertisement seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform peripheral id.
    pub id: String,
    /// Hardware address.
    pub address: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength.
    pub rssi: Option<i16>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

impl Advertisement {
    /// Advertises the UART service or carries the pendant name hint.
    pub fn is_candidate(&self) -> bool {
        self.services.contains(&UART_SERVICE_UUID)
            || self
                .name
                .as_deref()
                .is_some_and(|n| n.to_ascii_lowercase().contains(NAME_HINT))
    }

    /// Whether this advertisement belongs to `target` (by id or address).
    pub fn matches(&self, target: &BleDevice) -> bool {
        let mut keys = std::iter::once(target.id.as_str()).chain(target.address.as_deref());
        keys.any(|key| {
            self.id.eq_ignore_ascii_case(key) || self.address.eq_ignore_ascii_case(key)
        })
    }
}

/// BLE central role.
#[async_trait]
pub trait BleCentral: Send + Sync + 'static {
    /// Whether a usable adapter exists.
    async fn probe(&self) -> Result<bool>;

    /// Start scanning for peripherals advertising `services`. The stream
    /// yields advertisements until dropped; call [`BleCentral::stop_scan`]
    /// afterwards.
    async fn scan(&self, services: &[Uuid]) -> Result<BoxStream<'static, Advertisement>>;

    /// Stop a running scan.
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to the peripheral with platform id `id`.
    async fn connect(&self, id: &str) -> Result<Arc<dyn BleLink>>;
}

/// GATT access on one connected peripheral.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Discover services; returns each service with its characteristics.
    async fn discover(&self) -> Result<Vec<(Uuid, Vec<Uuid>)>>;

    /// Subscribe to notifications. The stream ends when the peripheral
    /// disconnects.
    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<BoxStream<'static, Vec<u8>>>;

    /// Write one chunk.
    async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Drop the connection.
    async fn disconnect(&self) -> Result<()>;
}

/// [`Driver`] for BLE pendants.
///
/// Discovery scans and the scans that locate a peripheral before
/// connecting share the adapter, so they never overlap: a second discovery
/// scan is rejected, and a connect waits for a running discovery to end.
pub struct BleDriver<C> {
    central: C,
    disabled: bool,
    scan_lock: tokio::sync::Mutex<()>,
}

/// BLE transport manager.
pub type BleManager<C> = TransportManager<BleDriver<C>>;

impl<C: BleCentral> BleDriver<C> {
    /// Wrap a central; honours [`DISABLE_ENV`].
    pub fn new(central: C) -> Self {
        let disabled = ble_disabled_by(std::env::var(DISABLE_ENV).ok().as_deref());
        Self {
            central,
            disabled,
            scan_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Force the transport on or off regardless of the environment.
    #[must_use]
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// The underlying central.
    pub fn central(&self) -> &C {
        &self.central
    }

    async fn stop_scan(&self) {
        if let Err(e) = self.central.stop_scan().await {
            debug!("[{TRANSPORT_ID}] Failed to stop scan: {e}");
        }
    }

    /// Scan until an advertisement for `target` shows up.
    async fn locate(&self, target: &BleDevice) -> Result<Advertisement> {
        let _scan = self.scan_lock.lock().await;
        let mut adverts = self.central.scan(&[UART_SERVICE_UUID]).await?;
        let found = tokio::time::timeout(LOCATE_TIMEOUT, async {
            while let Some(advert) = adverts.next().await {
                if advert.matches(target) {
                    return Some(advert);
                }
            }
            None
        })
        .await;
        drop(adverts);
        self.stop_scan().await;

        match found {
            Ok(Some(advert)) => Ok(advert),
            Ok(None) | Err(_) => Err(Error::DeviceNotFound(target.id.clone())),
        }
    }

    /// Check the UART service and subscribe to its notifications.
    async fn attach(link: &Arc<dyn BleLink>) -> Result<BoxStream<'static, Vec<u8>>> {
        let services = link.discover().await?;
        let complete = services.iter().any(|(service, characteristics)| {
            *service == UART_SERVICE_UUID
                && characteristics.contains(&UART_RX_CHAR_UUID)
                && characteristics.contains(&UART_TX_CHAR_UUID)
        });
        if !complete {
            return Err(Error::UnsupportedDevice(
                "does not support required UART service".to_string(),
            ));
        }
        link.subscribe(UART_SERVICE_UUID, UART_TX_CHAR_UUID).await
    }
}

#[async_trait]
impl<C: BleCentral> Driver for BleDriver<C> {
    type Target = BleDevice;
    const TRANSPORT_ID: &'static str = TRANSPORT_ID;

    async fn probe(&self) -> Result<bool> {
        if self.disabled {
            info!("[{TRANSPORT_ID}] Disabled by {DISABLE_ENV}");
            return Ok(false);
        }
        self.central.probe().await
    }

    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        let Ok(_scan) = self.scan_lock.try_lock() else {
            return Err(Error::ScanInProgress);
        };
        let mut adverts = self.central.scan(&[UART_SERVICE_UUID]).await?;
        let mut found: Vec<DiscoveredDevice> = Vec::new();

        let collect = async {
            while let Some(advert) = adverts.next().await {
                if !advert.is_candidate() || found.iter().any(|d| d.id == advert.id) {
                    continue;
                }
                debug!("[{TRANSPORT_ID}] Found {} ({:?})", advert.id, advert.name);
                found.push(DiscoveredDevice {
                    id: advert.id,
                    address: advert.address,
                    name: advert.name,
                    rssi: advert.rssi,
                });
            }
        };
        let _ = tokio::time::timeout(duration, collect).await;
        drop(adverts);
        self.stop_scan().await;
        Ok(found)
    }

    async fn open(&self, target: &BleDevice) -> Result<(BleDevice, Connection)> {
        let advert = self.locate(target).await?;
        debug!("[{TRANSPORT_ID}] Located {} at {}", advert.id, advert.address);

        let link = tokio::time::timeout(CONNECT_TIMEOUT, self.central.connect(&advert.id))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {}", advert.id)))??;

        let inbound = match Self::attach(&link).await {
            Ok(inbound) => inbound,
            Err(e) => {
                if let Err(close) = link.disconnect().await {
                    debug!("[{TRANSPORT_ID}] Disconnect after failed attach: {close}");
                }
                return Err(e);
            },
        };

        let resolved = BleDevice {
            id: advert.id,
            address: Some(advert.address),
            name: advert.name.or_else(|| target.name.clone()),
        };
        Ok((
            resolved,
            Connection {
                inbound,
                link: Arc::new(UartLink { link }),
            },
        ))
    }

    fn client_id(&self, target: &BleDevice) -> String {
        derive_client_id(
            CLIENT_PREFIX,
            target.address.as_deref().unwrap_or(&target.id),
        )
    }

    fn saved_target(&self, settings: &DeviceSettings) -> Option<BleDevice> {
        settings.ble_device.clone()
    }

    fn auto_connect(&self, settings: &DeviceSettings) -> bool {
        settings.ble_auto_connect
    }

    fn remember(&self, target: &BleDevice) -> SettingsPatch {
        SettingsPatch {
            ble_device: Some(target.clone()),
            ..Default::default()
        }
    }
}

/// Chunked writer onto the UART RX characteristic.
struct UartLink {
    link: Arc<dyn BleLink>,
}

#[async_trait]
impl Link for UartLink {
    /// Chunks go out in order; the first failure abandons the rest of the
    /// message without retrying or undoing the chunks already written.
    async fn send(&self, data: &[u8]) -> Result<()> {
        let total = data.len().div_ceil(WRITE_CHUNK_SIZE);
        for (index, chunk) in data.chunks(WRITE_CHUNK_SIZE).enumerate() {
            if let Err(e) = self
                .link
                .write(UART_SERVICE_UUID, UART_RX_CHAR_UUID, chunk)
                .await
            {
                warn!(
                    "[{TRANSPORT_ID}] Write failed on chunk {} of {total}: {e}",
                    index + 1
                );
                return Err(e);
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.link.disconnect().await {
            debug!("[{TRANSPORT_ID}] Disconnect failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::host::{ClientTransport, Host};
    use crate::transport::testing::{MockHost, settle};
    use futures::channel::mpsc::{self, UnboundedSender};
    use futures::stream;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeLink {
        services: Vec<(Uuid, Vec<Uuid>)>,
        fail_from: Option<usize>,
        notify: Mutex<Option<UnboundedSender<Vec<u8>>>>,
        writes: Mutex<Vec<Vec<u8>>>,
        attempts: AtomicUsize,
        subscribed: AtomicBool,
        disconnected: AtomicBool,
    }

    impl FakeLink {
        fn new(services: Vec<(Uuid, Vec<Uuid>)>, fail_from: Option<usize>) -> Self {
            Self {
                services,
                fail_from,
                notify: Mutex::new(None),
                writes: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
                subscribed: AtomicBool::new(false),
                disconnected: AtomicBool::new(false),
            }
        }

        fn notify(&self, data: &[u8]) {
            if let Some(tx) = self.notify.lock().as_ref() {
                tx.unbounded_send(data.to_vec()).unwrap();
            }
        }

        fn drop_peripheral(&self) {
            self.notify.lock().take();
        }
    }

    #[async_trait]
    impl BleLink for FakeLink {
        async fn discover(&self) -> Result<Vec<(Uuid, Vec<Uuid>)>> {
            Ok(self.services.clone())
        }

        async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<BoxStream<'static, Vec<u8>>> {
            assert_eq!(service, UART_SERVICE_UUID);
            assert_eq!(characteristic, UART_TX_CHAR_UUID);
            self.subscribed.store(true, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded();
            *self.notify.lock() = Some(tx);
            Ok(rx.boxed())
        }

        async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()> {
            assert_eq!(service, UART_SERVICE_UUID);
            assert_eq!(characteristic, UART_RX_CHAR_UUID);
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_from.is_some_and(|n| attempt >= n) {
                return Err(Error::Connection("GATT write rejected".to_string()));
            }
            self.writes.lock().push(data.to_vec());
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.disconnected.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeCentral {
        adverts: Vec<Advertisement>,
        services: Vec<(Uuid, Vec<Uuid>)>,
        connect_delay: Duration,
        fail_writes_from: Option<usize>,
        scans: AtomicUsize,
        stops: AtomicUsize,
        links: Mutex<Vec<Arc<FakeLink>>>,
    }

    impl FakeCentral {
        fn new(adverts: Vec<Advertisement>) -> Self {
            Self {
                adverts,
                services: vec![(UART_SERVICE_UUID, vec![UART_RX_CHAR_UUID, UART_TX_CHAR_UUID])],
                connect_delay: Duration::ZERO,
                fail_writes_from: None,
                scans: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                links: Mutex::new(Vec::new()),
            }
        }

        fn link(&self, index: usize) -> Arc<FakeLink> {
            Arc::clone(&self.links.lock()[index])
        }
    }

    #[async_trait]
    impl BleCentral for FakeCentral {
        async fn probe(&self) -> Result<bool> {
            Ok(true)
        }

        async fn scan(&self, services: &[Uuid]) -> Result<BoxStream<'static, Advertisement>> {
            assert_eq!(services, &[UART_SERVICE_UUID]);
            self.scans.fetch_add(1, Ordering::SeqCst);
            // Advertisements repeat until the scan is stopped
            Ok(stream::iter(self.adverts.clone())
                .chain(stream::pending())
                .boxed())
        }

        async fn stop_scan(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn connect(&self, _id: &str) -> Result<Arc<dyn BleLink>> {
            if !self.connect_delay.is_zero() {
                tokio::time::sleep(self.connect_delay).await;
            }
            let link = Arc::new(FakeLink::new(self.services.clone(), self.fail_writes_from));
            self.links.lock().push(Arc::clone(&link));
            Ok(link)
        }
    }

    fn advert(id: &str, address: &str, name: Option<&str>, uart: bool) -> Advertisement {
        Advertisement {
            id: id.to_string(),
            address: address.to_string(),
            name: name.map(str::to_string),
            rssi: Some(-60),
            services: if uart { vec![UART_SERVICE_UUID] } else { Vec::new() },
        }
    }

    fn pendant() -> Advertisement {
        advert("peripheral-1", "C0:FF:EE:00:11:22", Some("Pendant"), true)
    }

    async fn manager(central: FakeCentral) -> (BleManager<FakeCentral>, Arc<MockHost>) {
        let host = MockHost::with_settings(DeviceSettings::default());
        let driver = BleDriver::new(central).with_disabled(false);
        let manager = TransportManager::new(driver, host.clone());
        assert!(manager.initialize().await.unwrap());
        (manager, host)
    }

    #[test]
    fn test_env_toggle_values() {
        assert!(!ble_disabled_by(None));
        assert!(!ble_disabled_by(Some("")));
        assert!(!ble_disabled_by(Some("0")));
        assert!(!ble_disabled_by(Some("FALSE")));
        assert!(ble_disabled_by(Some("1")));
        assert!(ble_disabled_by(Some("true")));
        assert!(ble_disabled_by(Some("yes")));
    }

    #[test]
    fn test_advertisement_matching() {
        let ad = pendant();
        assert!(ad.is_candidate());
        assert!(ad.matches(&BleDevice::new("PERIPHERAL-1")));
        assert!(ad.matches(&BleDevice::new("c0:ff:ee:00:11:22")));
        let by_address = BleDevice {
            address: Some("C0:FF:EE:00:11:22".to_string()),
            ..BleDevice::new("stale-id")
        };
        assert!(ad.matches(&by_address));
        assert!(!ad.matches(&BleDevice::new("other")));

        assert!(advert("x", "x", Some("MyPENDANT-2"), false).is_candidate());
        assert!(!advert("y", "y", Some("Headphones"), false).is_candidate());
        assert!(!advert("z", "z", None, false).is_candidate());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_transport_reports_unavailable() {
        let host = MockHost::with_settings(DeviceSettings::default());
        let driver = BleDriver::new(FakeCentral::new(Vec::new())).with_disabled(true);
        let manager = TransportManager::new(driver, host.clone());
        assert!(!manager.initialize().await.unwrap());
        assert!(host.registered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_filters_and_dedupes() {
        let central = FakeCentral::new(vec![
            pendant(),
            pendant(),
            advert("peripheral-2", "C0:FF:EE:00:11:33", Some("pendant-bench"), false),
            advert("peripheral-3", "AA:AA:AA:AA:AA:AA", Some("Headphones"), false),
        ]);
        let (manager, _host) = manager(central).await;

        let start = tokio::time::Instant::now();
        let found = manager.scan_devices(Duration::from_secs(3)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));

        let ids: Vec<_> = found.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["peripheral-1", "peripheral-2"]);
        assert_eq!(found[0].rssi, Some(-60));
        assert_eq!(manager.driver().central().stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_waits_for_running_scan() {
        let (manager, _host) = manager(FakeCentral::new(vec![pendant()])).await;

        let scanning = manager.clone();
        let scan = tokio::spawn(async move { scanning.scan_devices(Duration::from_secs(10)).await });
        settle().await;

        let connecting = manager.clone();
        let connect = tokio::spawn(async move { connecting.connect(BleDevice::new("peripheral-1")).await });
        tokio::time::sleep(Duration::from_secs(5)).await;

        // Still only the discovery scan, and nothing has stopped it
        let central = manager.driver().central();
        assert_eq!(central.scans.load(Ordering::SeqCst), 1);
        assert_eq!(central.stops.load(Ordering::SeqCst), 0);
        assert!(!scan.is_finished());
        assert!(!manager.is_connected());

        let found = scan.await.unwrap().unwrap();
        assert_eq!(found.len(), 1);
        connect.await.unwrap().unwrap();
        assert!(manager.is_connected());
        assert_eq!(central.scans.load(Ordering::SeqCst), 2);
        assert_eq!(central.stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_rejected_while_locating() {
        let (manager, _host) = manager(FakeCentral::new(Vec::new())).await;

        let connecting = manager.clone();
        let connect = tokio::spawn(async move { connecting.connect(BleDevice::new("peripheral-1")).await });
        settle().await;

        let err = manager
            .scan_devices(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScanInProgress));
        assert_eq!(manager.driver().central().scans.load(Ordering::SeqCst), 1);

        assert!(matches!(connect.await.unwrap(), Err(Error::DeviceNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_subscribes_and_delivers_messages() {
        let (manager, host) = manager(FakeCentral::new(vec![pendant()])).await;
        manager
            .connect(BleDevice::new("C0:FF:EE:00:11:22"))
            .await
            .unwrap();

        let link = manager.driver().central().link(0);
        assert!(link.subscribed.load(Ordering::SeqCst));

        let status = manager.status();
        assert_eq!(status.client_id.as_deref(), Some("ble-C0FFEE001122"));
        let device = status.device.unwrap();
        assert_eq!(device.id, "peripheral-1");
        assert_eq!(device.name.as_deref(), Some("Pendant"));
        assert_eq!(host.settings().ble_device, Some(device));

        link.notify(b"{\"feed\":");
        link.notify(b"1200}\n{\"spindle\":\"on\"}\n");
        settle().await;
        assert_eq!(
            host.messages(),
            vec![json!({"feed": 1200}), json!({"spindle": "on"})]
        );
        assert_eq!(host.submissions()[0].0.0, "ble");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_uart_service_is_unsupported() {
        let mut central = FakeCentral::new(vec![pendant()]);
        central.services = vec![(UART_SERVICE_UUID, vec![UART_RX_CHAR_UUID])];
        let (manager, _host) = manager(central).await;

        let err = manager
            .connect(BleDevice::new("peripheral-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedDevice(_)));
        assert!(err.to_string().contains("does not support required UART service"));

        let link = manager.driver().central().link(0);
        assert!(link.disconnected.load(Ordering::SeqCst));
        assert!(!manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device_times_out_locating() {
        let (manager, _host) = manager(FakeCentral::new(vec![pendant()])).await;
        let start = tokio::time::Instant::now();
        let err = manager
            .connect(BleDevice::new("nowhere"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(ref id) if id == "nowhere"));
        assert!(start.elapsed() >= LOCATE_TIMEOUT);
        assert_eq!(manager.driver().central().stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let mut central = FakeCentral::new(vec![pendant()]);
        central.connect_delay = Duration::from_secs(30);
        let (manager, _host) = manager(central).await;

        let err = manager
            .connect(BleDevice::new("peripheral-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_message_is_chunked() {
        let (manager, _host) = manager(FakeCentral::new(vec![pendant()])).await;
        manager.connect(BleDevice::new("peripheral-1")).await.unwrap();

        let message = json!({"cmd": "jog", "axis": "x", "distance": 10.5, "feed": 600});
        let mut expected = serde_json::to_vec(&message).unwrap();
        expected.push(b'\n');

        manager.send(&message).await.unwrap();
        let writes = manager.driver().central().link(0).writes.lock().clone();
        assert_eq!(writes.len(), expected.len().div_ceil(WRITE_CHUNK_SIZE));
        assert!(writes.iter().all(|w| w.len() <= WRITE_CHUNK_SIZE));
        assert_eq!(writes.concat(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_abandons_rest_of_message() {
        let mut central = FakeCentral::new(vec![pendant()]);
        central.fail_writes_from = Some(1);
        let (manager, _host) = manager(central).await;
        manager.connect(BleDevice::new("peripheral-1")).await.unwrap();

        let message = json!({"text": "a message long enough for several chunks"});
        assert!(manager.send(&message).await.is_err());

        let link = manager.driver().central().link(0);
        assert_eq!(link.writes.lock().len(), 1);
        assert_eq!(link.attempts.load(Ordering::SeqCst), 2);

        // Broadcast failures are logged, not raised
        manager.on_broadcast("state", &message).await;
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peripheral_disconnect_schedules_reconnect() {
        let central = FakeCentral::new(vec![pendant()]);
        let host = MockHost::with_settings(DeviceSettings {
            ble_device: Some(BleDevice::new("peripheral-1")),
            ble_auto_connect: true,
            ..Default::default()
        });
        let manager = TransportManager::new(BleDriver::new(central).with_disabled(false), host.clone());
        assert!(manager.initialize().await.unwrap());
        settle().await;
        assert!(manager.is_connected());

        manager.driver().central().link(0).drop_peripheral();
        settle().await;
        assert!(!manager.is_connected());
        assert!(manager.reconnect_pending());
    }
}
