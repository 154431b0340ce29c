//! Wireless scan and stdin/stdout bridge commands.
//!
//! `connect` runs one transport manager under the CLI host: every JSON
//! message from the pendant is printed to stdout as one line, and every
//! JSON line read from stdin is broadcast to the pendant.

use anyhow::{Context, Result};
use console::style;
use log::{debug, info, warn};
use pendant_link::transport::ble::BleDriver;
use pendant_link::transport::btleplug_backend::BtleplugCentral;
use pendant_link::transport::classic::ClassicDriver;
use pendant_link::transport::spp_serial::SerialSppBackend;
use pendant_link::transport::{
    BleDevice, BleManager, ClassicDevice, ClassicManager, DiscoveredDevice, Driver, Host,
    SettingsPatch, TransportManager,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::config::Config;
use crate::host::{CliHost, Inbound};
use crate::{Cli, CliError, TransportArg};

/// Broadcast kind used for messages read from stdin.
const STDIN_KIND: &str = "message";

/// Arguments of `connect`.
pub(crate) struct ConnectRequest {
    pub(crate) transport: TransportArg,
    pub(crate) device: Option<String>,
    pub(crate) channel: Option<u8>,
    pub(crate) name: Option<String>,
    pub(crate) auto_connect: bool,
}

fn classic_manager(host: &Arc<CliHost>) -> ClassicManager<SerialSppBackend> {
    TransportManager::new(ClassicDriver::new(SerialSppBackend::new()), host.clone())
}

fn ble_manager(host: &Arc<CliHost>) -> BleManager<BtleplugCentral> {
    TransportManager::new(BleDriver::new(BtleplugCentral::new()), host.clone())
}

async fn initialize<D: Driver>(manager: &TransportManager<D>) -> Result<()> {
    if manager.initialize().await? {
        Ok(())
    } else {
        Err(pendant_link::Error::Unavailable(format!(
            "{} transport is not available on this host",
            manager.transport_id()
        ))
        .into())
    }
}

async fn scan_with<D: Driver>(
    manager: TransportManager<D>,
    duration: Duration,
) -> Result<Vec<DiscoveredDevice>> {
    initialize(&manager).await?;
    let devices = manager.scan_devices(duration).await;
    manager.shutdown().await;
    Ok(devices?)
}

/// Scan command implementation.
pub(crate) async fn cmd_scan(
    mut config: Config,
    transport: TransportArg,
    duration_secs: u64,
    json: bool,
) -> Result<()> {
    // Scanning never opens a session.
    config.bluetooth.auto_connect = Some(false);
    config.ble.auto_connect = Some(false);
    let (tx, _rx) = mpsc::unbounded_channel();
    let host = CliHost::ephemeral(config, tx);

    let duration = Duration::from_secs(duration_secs);
    if !json {
        eprintln!(
            "{} Scanning for {duration_secs}s...",
            style("📡").cyan()
        );
    }
    let devices = match transport {
        TransportArg::Classic => scan_with(classic_manager(&host), duration).await?,
        TransportArg::Ble => scan_with(ble_manager(&host), duration).await?,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&devices).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!("{}", style("Nearby devices").bold().underlined());
    if devices.is_empty() {
        eprintln!("  {}", style("No devices found").dim());
    }
    for device in &devices {
        let name = device
            .name
            .as_deref()
            .map(|n| format!(" - {n}"))
            .unwrap_or_default();
        let rssi = device
            .rssi
            .map(|r| format!(" ({r} dBm)"))
            .unwrap_or_default();
        eprintln!(
            "  {} {}{}{}",
            style("•").green(),
            style(&device.id).cyan(),
            name,
            style(rssi).dim()
        );
    }
    Ok(())
}

/// Connect command implementation.
pub(crate) async fn cmd_connect(cli: &Cli, config: Config, request: ConnectRequest) -> Result<()> {
    if request.transport == TransportArg::Ble && request.channel.is_some() {
        return Err(CliError::Usage("--channel only applies to the classic transport".to_string()).into());
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let host = CliHost::new(config, tx);

    if request.auto_connect {
        let patch = match request.transport {
            TransportArg::Classic => SettingsPatch {
                bluetooth_auto_connect: Some(true),
                ..Default::default()
            },
            TransportArg::Ble => SettingsPatch {
                ble_auto_connect: Some(true),
                ..Default::default()
            },
        };
        host.update_settings(patch);
    }

    match request.transport {
        TransportArg::Classic => {
            let target = request.device.map(|address| ClassicDevice {
                address,
                channel: request.channel,
                name: request.name,
            });
            run_bridge(cli, classic_manager(&host), &host, target, rx).await
        },
        TransportArg::Ble => {
            let target = request.device.map(|id| BleDevice {
                id,
                address: None,
                name: request.name,
            });
            run_bridge(cli, ble_manager(&host), &host, target, rx).await
        },
    }
}

/// Connect to `target` (or the saved device) and pump messages until
/// stdin closes or Ctrl-C.
async fn run_bridge<D: Driver>(
    cli: &Cli,
    manager: TransportManager<D>,
    host: &Arc<CliHost>,
    target: Option<D::Target>,
    mut inbound: UnboundedReceiver<Inbound>,
) -> Result<()> {
    let id = manager.transport_id();
    initialize(&manager).await?;

    let settings = host.settings();
    let target = match target {
        Some(target) => Some(target),
        None => match manager.driver().saved_target(&settings) {
            None => {
                manager.shutdown().await;
                return Err(CliError::Usage(
                    "no device given and none saved; pass --device".to_string(),
                )
                .into());
            },
            // initialize() already started the saved device's auto-connect
            Some(_) if manager.driver().auto_connect(&settings) => None,
            Some(saved) => Some(saved),
        },
    };

    if let Some(target) = target {
        if let Err(e) = manager.connect(target).await {
            manager.shutdown().await;
            return Err(e).with_context(|| format!("{id} connect failed"));
        }
        if !cli.quiet {
            let status = manager.status();
            eprintln!(
                "{} Connected as {}",
                style("✓").green(),
                style(status.client_id.unwrap_or_default()).cyan()
            );
        }
    } else {
        info!("[{id}] Waiting for auto-connect");
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            Some(message) = inbound.recv() => {
                debug!("[{}] {} -> stdout", message.transport_id, message.client_id);
                println!("{}", serde_json::to_string(&message.message)?);
            },
            line = stdin.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    info!("stdin closed");
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(line) {
                    Ok(message) => host.broadcast(STDIN_KIND, &message).await,
                    Err(e) => warn!("Ignoring invalid JSON on stdin: {e}"),
                }
            },
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            },
        }
    }

    host.shutdown().await;
    Ok(())
}
