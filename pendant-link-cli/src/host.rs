//! Transport host backed by the CLI configuration.
//!
//! Inbound device messages are forwarded on a channel for the bridge loop
//! to print; settings live in the loaded [`Config`] and are written back
//! to disk on every update.

use crate::config::Config;
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use pendant_link::transport::{ClientTransport, DeviceSettings, Host, SettingsPatch};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// One decoded message from a device.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Inbound {
    /// Transport the message arrived on.
    pub(crate) transport_id: String,
    /// Sending client.
    pub(crate) client_id: String,
    /// Decoded JSON.
    pub(crate) message: Value,
}

pub(crate) struct CliHost {
    config: Mutex<Config>,
    persist: bool,
    transports: Mutex<Vec<(String, Arc<dyn ClientTransport>)>>,
    inbound: UnboundedSender<Inbound>,
}

impl CliHost {
    /// Host that writes settings changes through to the config file.
    pub(crate) fn new(config: Config, inbound: UnboundedSender<Inbound>) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            persist: true,
            transports: Mutex::new(Vec::new()),
            inbound,
        })
    }

    /// Host that keeps settings changes in memory only.
    pub(crate) fn ephemeral(config: Config, inbound: UnboundedSender<Inbound>) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            persist: false,
            transports: Mutex::new(Vec::new()),
            inbound,
        })
    }

    fn registered(&self) -> Vec<(String, Arc<dyn ClientTransport>)> {
        self.transports.lock().clone()
    }

    /// Relay a host message to every registered transport.
    pub(crate) async fn broadcast(&self, kind: &str, message: &Value) {
        for (id, transport) in self.registered() {
            debug!("Relaying {kind} to {id}");
            transport.on_broadcast(kind, message).await;
        }
    }

    /// Shut down every registered transport.
    pub(crate) async fn shutdown(&self) {
        for (_, transport) in self.registered() {
            transport.on_shutdown().await;
        }
    }
}

impl Host for CliHost {
    fn register_client_transport(&self, transport_id: &str, transport: Arc<dyn ClientTransport>) {
        let mut transports = self.transports.lock();
        transports.retain(|(id, _)| id != transport_id);
        transports.push((transport_id.to_string(), transport));
    }

    fn submit_client_message(&self, transport_id: &str, client_id: &str, message: Value) {
        let inbound = Inbound {
            transport_id: transport_id.to_string(),
            client_id: client_id.to_string(),
            message,
        };
        if self.inbound.send(inbound).is_err() {
            debug!("Bridge closed, dropping message from {client_id}");
        }
    }

    fn settings(&self) -> DeviceSettings {
        self.config.lock().device_settings()
    }

    fn update_settings(&self, patch: SettingsPatch) {
        let mut config = self.config.lock();
        config.apply(&patch);
        if self.persist {
            if let Err(e) = config.persist(&patch) {
                warn!("Failed to save device settings: {e:#}");
            }
        }
    }
}
