//! In-memory host and link doubles for transport tests.

use super::host::{ClientTransport, DeviceSettings, Host, SettingsPatch};
use super::manager::Link;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Let spawned tasks run; advances a paused clock by 1ms.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// A byte stream fed by the returned sender; closing the sender ends it.
pub(crate) fn inbound_channel() -> (UnboundedSender<Vec<u8>>, BoxStream<'static, Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded();
    (tx, rx.boxed())
}

type Submission = ((String, String), Value);

#[derive(Default)]
pub(crate) struct MockHost {
    settings: Mutex<DeviceSettings>,
    submissions: Mutex<Vec<Submission>>,
    registered: Mutex<Vec<String>>,
}

impl MockHost {
    pub(crate) fn with_settings(settings: DeviceSettings) -> Arc<Self> {
        Arc::new(Self {
            settings: Mutex::new(settings),
            ..Default::default()
        })
    }

    pub(crate) fn messages(&self) -> Vec<Value> {
        self.submissions.lock().iter().map(|(_, v)| v.clone()).collect()
    }

    pub(crate) fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    pub(crate) fn registered(&self) -> Vec<String> {
        self.registered.lock().clone()
    }
}

impl Host for MockHost {
    fn register_client_transport(&self, transport_id: &str, _transport: Arc<dyn ClientTransport>) {
        self.registered.lock().push(transport_id.to_string());
    }

    fn submit_client_message(&self, transport_id: &str, client_id: &str, message: Value) {
        self.submissions
            .lock()
            .push(((transport_id.to_string(), client_id.to_string()), message));
    }

    fn settings(&self) -> DeviceSettings {
        self.settings.lock().clone()
    }

    fn update_settings(&self, patch: SettingsPatch) {
        self.settings.lock().apply(patch);
    }
}

/// Records writes; optionally fails from the `fail_at`-th write on.
#[derive(Default)]
pub(crate) struct MockLink {
    sent: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
    writes: AtomicUsize,
    fail_at: Mutex<Option<usize>>,
}

impl MockLink {
    pub(crate) fn failing_at(write: usize) -> Self {
        Self {
            fail_at: Mutex::new(Some(write)),
            ..Default::default()
        }
    }

    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Link for MockLink {
    async fn send(&self, data: &[u8]) -> Result<()> {
        let index = self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_at.lock().is_some_and(|n| index >= n) {
            return Err(Error::Connection("write failed".to_string()));
        }
        self.sent.lock().push(data.to_vec());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
