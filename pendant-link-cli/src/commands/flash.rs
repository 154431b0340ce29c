//! USB and OTA flash command implementations.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use pendant_link::flash::ota::{OtaFlashRequest, flash_ota};
use pendant_link::flash::usb::{UsbFlashRequest, flash_usb, tool_path};
use pendant_link::{FlashEvent, FlashEvents};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{Config, DEFAULT_BAUD};
use crate::{Cli, CliError, use_fancy_output};

/// USB flash overrides from the command line.
pub(crate) struct UsbOptions {
    pub(crate) port: Option<String>,
    pub(crate) baud: Option<u32>,
    pub(crate) tool_dir: Option<PathBuf>,
}

fn ensure_firmware(firmware: &Path) -> Result<()> {
    if firmware.is_file() {
        Ok(())
    } else {
        Err(CliError::Usage(format!("firmware file not found: {}", firmware.display())).into())
    }
}

fn progress_bar(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Drive a flash job to its terminal event, rendering progress.
async fn drive(cli: &Cli, mut events: FlashEvents) -> Result<String> {
    let pb = progress_bar(cli);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = &mut ctrl_c => {
                pb.abandon_with_message("Interrupted");
                return Err(CliError::Cancelled("flash interrupted".to_string()).into());
            },
        };
        match event {
            Some(FlashEvent::Message(text)) => {
                if pb.is_hidden() {
                    log::info!("{text}");
                } else {
                    pb.println(text);
                }
            },
            Some(FlashEvent::Progress { percent, label }) => {
                pb.set_position(u64::from(percent));
                pb.set_message(label);
            },
            Some(FlashEvent::Complete(summary)) => {
                pb.finish_with_message("Done");
                return Ok(summary);
            },
            Some(FlashEvent::Error(reason)) => {
                pb.abandon();
                return Err(pendant_link::Error::Flash(reason).into());
            },
            None => {
                pb.abandon();
                return Err(pendant_link::Error::Flash("flash job ended unexpectedly".to_string()).into());
            },
        }
    }
}

/// Flash over USB with esptool.
pub(crate) async fn cmd_flash_usb(
    cli: &Cli,
    config: &Config,
    firmware: &Path,
    options: UsbOptions,
) -> Result<()> {
    ensure_firmware(firmware)?;

    let tool_dir = options
        .tool_dir
        .or_else(|| config.flash.tool_dir.clone())
        .ok_or_else(|| {
            CliError::Usage("no tool directory; pass --tool-dir or set [flash] tool_dir".to_string())
        })?;

    let port = match options.port.or_else(|| config.flash.port.clone()) {
        Some(port) => port,
        None => {
            pendant_link::auto_detect_port()
                .context("no serial port given and none detected")?
                .name
        },
    };
    let baud = options.baud.or(config.flash.baud).unwrap_or(DEFAULT_BAUD);

    if !cli.quiet {
        eprintln!(
            "{} Flashing {} via {} @ {baud}",
            style("🔌").cyan(),
            firmware.display(),
            style(&port).cyan()
        );
        log::debug!("Using {}", tool_path(&tool_dir).display());
    }

    let request = UsbFlashRequest::new(firmware, port, baud, tool_dir);
    let summary = drive(cli, flash_usb(request)).await?;
    if !cli.quiet {
        eprintln!("\n{} {summary}", style("🎉").green().bold());
    }
    Ok(())
}

/// Upload firmware to the device's OTA endpoint.
pub(crate) async fn cmd_flash_ota(
    cli: &Cli,
    config: &Config,
    firmware: &Path,
    address: Option<&str>,
    timeout_secs: u64,
) -> Result<()> {
    ensure_firmware(firmware)?;

    let address = address
        .map(str::to_string)
        .or_else(|| config.flash.ota_address.clone())
        .ok_or_else(|| {
            CliError::Usage("no device address; pass --address or set [flash] ota_address".to_string())
        })?;

    let request = OtaFlashRequest::new(firmware, address)
        .with_timeout(Duration::from_secs(timeout_secs));
    if !cli.quiet {
        eprintln!(
            "{} Uploading {} to {}",
            style("📦").cyan(),
            firmware.display(),
            style(request.url()).cyan()
        );
    }

    let summary = drive(cli, flash_ota(request)).await?;
    if !cli.quiet {
        eprintln!("\n{} {summary}", style("🎉").green().bold());
    }
    Ok(())
}
