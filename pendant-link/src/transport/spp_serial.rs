//! SPP backend over OS-bound Bluetooth serial devices.
//!
//! Operating systems expose a paired SPP device as a serial port
//! (`/dev/rfcommN`, `/dev/cu.<name>`, an outgoing `COMn`). The binding
//! already fixed the RFCOMM channel, so lookup always reports
//! [`BOUND_CHANNEL`]. Reads run on a dedicated blocking thread over a
//! cloned port handle; writes go through `spawn_blocking`.

use super::classic::SppBackend;
use super::host::DiscoveredDevice;
use super::manager::{Connection, Link};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::stream::{self, BoxStream};
use log::{debug, trace};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Channel reported for OS-bound links.
pub const BOUND_CHANNEL: u8 = 1;

/// Line rate for the virtual port; RFCOMM ignores it.
pub const DEFAULT_BAUD: u32 = 115_200;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// [`SppBackend`] using `serialport`.
#[derive(Debug, Clone)]
pub struct SerialSppBackend {
    baud: u32,
}

impl Default for SerialSppBackend {
    fn default() -> Self {
        Self { baud: DEFAULT_BAUD }
    }
}

impl SerialSppBackend {
    /// Backend with the default line rate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the line rate.
    #[must_use]
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }
}

#[async_trait]
impl SppBackend for SerialSppBackend {
    async fn probe(&self) -> Result<bool> {
        Ok(crate::ports::is_available())
    }

    async fn inquire(&self) -> Result<BoxStream<'static, DiscoveredDevice>> {
        let ports = tokio::task::spawn_blocking(crate::ports::detect_bluetooth_ports)
            .await
            .map_err(|e| Error::Unavailable(format!("port enumeration failed: {e}")))?;
        let devices: Vec<DiscoveredDevice> = ports
            .into_iter()
            .map(|port| DiscoveredDevice {
                id: port.name.clone(),
                address: port.name,
                name: port.product,
                rssi: None,
            })
            .collect();
        Ok(stream::iter(devices).boxed())
    }

    async fn find_channel(&self, _address: &str) -> Result<u8> {
        Ok(BOUND_CHANNEL)
    }

    async fn open(&self, address: &str, channel: u8) -> Result<Connection> {
        if channel != BOUND_CHANNEL {
            debug!("Ignoring channel {channel} for OS-bound port {address}");
        }
        let path = address.to_string();
        let baud = self.baud;
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&path, baud).timeout(READ_TIMEOUT).open()
        })
        .await
        .map_err(|e| Error::Connection(format!("open task failed: {e}")))??;

        let reader = port.try_clone()?;
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded();
        let running_reader = Arc::clone(&running);
        std::thread::Builder::new()
            .name(format!("spp-reader {address}"))
            .spawn(move || read_loop(reader, &tx, &running_reader))?;

        Ok(Connection {
            inbound: rx.boxed(),
            link: Arc::new(SerialLink {
                port: Arc::new(Mutex::new(port)),
                running,
            }),
        })
    }
}

/// Forward reads until closed or the port fails; dropping `tx` ends the
/// inbound stream.
fn read_loop(
    mut port: Box<dyn serialport::SerialPort>,
    tx: &UnboundedSender<Vec<u8>>,
    running: &AtomicBool,
) {
    let mut buf = [0u8; 1024];
    while running.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => {},
            Ok(n) => {
                trace!("SPP read {n} bytes");
                if tx.unbounded_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            },
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {},
            Err(e) => {
                debug!("SPP read failed: {e}");
                break;
            },
        }
    }
}

struct SerialLink {
    port: Arc<Mutex<Box<dyn serialport::SerialPort>>>,
    running: Arc<AtomicBool>,
}

#[async_trait]
impl Link for SerialLink {
    async fn send(&self, data: &[u8]) -> Result<()> {
        let port = Arc::clone(&self.port);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut port = port.lock();
            port.write_all(&data)?;
            port.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Connection(format!("write task failed: {e}")))?
    }

    async fn close(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}
