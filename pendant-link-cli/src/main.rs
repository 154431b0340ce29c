//! pendant-link CLI - flash and bridge ESP32 pendants.
//!
//! ## Features
//!
//! - Flash firmware over USB (esptool) or over the air
//! - List serial ports and auto-detect ESP32 boards
//! - Scan for pendants over Bluetooth Classic or BLE
//! - Bridge a pendant's JSON-lines protocol to stdin/stdout
//! - Shell completion generation

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod host;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if progress bars and colors should be used.
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// pendant-link - firmware provisioning and wireless bridge for ESP32 pendants.
///
/// Environment variables:
///   PENDANT_PORT          - Default serial port for USB flashing
///   PENDANT_BAUD          - Default baud rate (default: 460800)
///   PENDANT_TOOL_DIR      - Directory containing bin/esptool-*
///   PENDANT_OTA_ADDRESS   - Default device address for OTA
///   PENDANT_DISABLE_BLE   - Disable the BLE transport
#[derive(Parser)]
#[command(name = "pendant-link")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Wireless transport selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum TransportArg {
    /// Bluetooth Classic (SPP).
    Classic,
    /// Bluetooth Low Energy (Nordic UART).
    Ble,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Flash a firmware image over USB using esptool.
    FlashUsb {
        /// Path to the firmware binary.
        firmware: PathBuf,

        /// Serial port (auto-detected if not specified).
        #[arg(short, long, env = "PENDANT_PORT")]
        port: Option<String>,

        /// Baud rate for the transfer.
        #[arg(short, long, env = "PENDANT_BAUD")]
        baud: Option<u32>,

        /// Directory containing bin/esptool-<platform>.
        #[arg(long, env = "PENDANT_TOOL_DIR", value_name = "DIR")]
        tool_dir: Option<PathBuf>,
    },

    /// Upload a firmware image to the device's /update endpoint.
    FlashOta {
        /// Path to the firmware binary.
        firmware: PathBuf,

        /// Device address (host or host:port).
        #[arg(short, long, env = "PENDANT_OTA_ADDRESS")]
        address: Option<String>,

        /// Abort the upload after this many seconds.
        #[arg(long, default_value = "120")]
        timeout_secs: u64,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Scan for nearby pendants.
    Scan {
        /// Transport to scan with.
        #[arg(short, long, value_enum)]
        transport: TransportArg,

        /// Scan duration.
        #[arg(long, default_value = "10")]
        duration_secs: u64,

        /// Output devices as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Connect to a pendant and bridge its messages to stdin/stdout.
    Connect {
        /// Transport to connect with.
        #[arg(short, long, value_enum)]
        transport: TransportArg,

        /// Device address (Classic) or peripheral id/address (BLE).
        /// Defaults to the saved device.
        #[arg(short, long)]
        device: Option<String>,

        /// RFCOMM channel (Classic only; looked up when omitted).
        #[arg(long)]
        channel: Option<u8>,

        /// Friendly name to store with the device.
        #[arg(long)]
        name: Option<String>,

        /// Enable automatic reconnection and remember it.
        #[arg(long)]
        auto_connect: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Errors the CLI raises itself, as opposed to library failures.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation.
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// Process exit code for an error.
///
/// 2 usage, 3 configuration, 4 device not found, 130 cancelled, 1 otherwise.
pub(crate) fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli) = err.downcast_ref::<CliError>() {
        return match cli {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<pendant_link::Error>() {
        Some(pendant_link::Error::Config(_)) => 3,
        Some(pendant_link::Error::DeviceNotFound(_)) => 4,
        _ => 1,
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

async fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::FlashUsb {
            firmware,
            port,
            baud,
            tool_dir,
        } => {
            let options = commands::flash::UsbOptions {
                port: port.clone(),
                baud: *baud,
                tool_dir: tool_dir.clone(),
            };
            commands::flash::cmd_flash_usb(cli, &config, firmware, options).await?;
        },
        Commands::FlashOta {
            firmware,
            address,
            timeout_secs,
        } => {
            commands::flash::cmd_flash_ota(cli, &config, firmware, address.as_deref(), *timeout_secs)
                .await?;
        },
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(*json);
        },
        Commands::Scan {
            transport,
            duration_secs,
            json,
        } => {
            commands::bridge::cmd_scan(config, *transport, *duration_secs, *json).await?;
        },
        Commands::Connect {
            transport,
            device,
            channel,
            name,
            auto_connect,
        } => {
            let request = commands::bridge::ConnectRequest {
                transport: *transport,
                device: device.clone(),
                channel: *channel,
                name: name.clone(),
                auto_connect: *auto_connect,
            };
            commands::bridge::cmd_connect(cli, config, request).await?;
        },
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    debug!(
        "pendant-link v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli).await {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash_usb() {
        let cli = Cli::try_parse_from([
            "pendant-link",
            "flash-usb",
            "fw.bin",
            "-p",
            "/dev/ttyUSB0",
            "-b",
            "921600",
            "--tool-dir",
            "/opt/pendant",
        ])
        .unwrap();
        match cli.command {
            Commands::FlashUsb {
                firmware,
                port,
                baud,
                tool_dir,
            } => {
                assert_eq!(firmware, PathBuf::from("fw.bin"));
                assert_eq!(port.as_deref(), Some("/dev/ttyUSB0"));
                assert_eq!(baud, Some(921_600));
                assert_eq!(tool_dir, Some(PathBuf::from("/opt/pendant")));
            },
            _ => panic!("expected flash-usb"),
        }
    }

    #[test]
    fn test_cli_parse_flash_ota_defaults() {
        let cli =
            Cli::try_parse_from(["pendant-link", "flash-ota", "fw.bin", "-a", "192.168.4.1"]).unwrap();
        match cli.command {
            Commands::FlashOta {
                address,
                timeout_secs,
                ..
            } => {
                assert_eq!(address.as_deref(), Some("192.168.4.1"));
                assert_eq!(timeout_secs, 120);
            },
            _ => panic!("expected flash-ota"),
        }
    }

    #[test]
    fn test_cli_parse_connect() {
        let cli = Cli::try_parse_from([
            "pendant-link",
            "connect",
            "--transport",
            "classic",
            "--device",
            "AA:BB:CC:DD:EE:FF",
            "--channel",
            "3",
            "--auto-connect",
        ])
        .unwrap();
        match cli.command {
            Commands::Connect {
                transport,
                device,
                channel,
                auto_connect,
                ..
            } => {
                assert_eq!(transport, TransportArg::Classic);
                assert_eq!(device.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
                assert_eq!(channel, Some(3));
                assert!(auto_connect);
            },
            _ => panic!("expected connect"),
        }
    }

    #[test]
    fn test_cli_parse_scan_defaults() {
        let cli = Cli::try_parse_from(["pendant-link", "scan", "-t", "ble"]).unwrap();
        match cli.command {
            Commands::Scan {
                transport,
                duration_secs,
                json,
            } => {
                assert_eq!(transport, TransportArg::Ble);
                assert_eq!(duration_secs, 10);
                assert!(!json);
            },
            _ => panic!("expected scan"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_transport() {
        assert!(Cli::try_parse_from(["pendant-link", "scan", "-t", "wifi"]).is_err());
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["pendant-link"]).is_err());
    }

    #[test]
    fn test_exit_code_mapping() {
        let usage: anyhow::Error = CliError::Usage("bad".into()).into();
        let cancelled: anyhow::Error = CliError::Cancelled("stop".into()).into();
        let missing: anyhow::Error = pendant_link::Error::DeviceNotFound("x".into()).into();
        let config: anyhow::Error = pendant_link::Error::Config("x".into()).into();
        let other = anyhow::anyhow!("boom");
        assert_eq!(exit_code(&usage), 2);
        assert_eq!(exit_code(&cancelled), 130);
        assert_eq!(exit_code(&missing), 4);
        assert_eq!(exit_code(&config), 3);
        assert_eq!(exit_code(&other), 1);
    }

    #[test]
    fn test_exit_code_sees_through_context() {
        use anyhow::Context as _;
        let err = Err::<(), _>(pendant_link::Error::DeviceNotFound("x".into()))
            .context("flashing")
            .unwrap_err();
        assert_eq!(exit_code(&err), 4);
    }
}
