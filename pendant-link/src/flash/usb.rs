//! USB flashing through an external esptool binary.
//!
//! The ROM bootloader protocol is not implemented here. A platform-specific
//! esptool build shipped next to the application does the work; this engine
//! spawns it, turns its stdout/stderr into [`FlashEvent`](super::FlashEvent)s
//! and interprets the exit code.
//!
//! esptool's log format is not a stable interface, so progress is derived
//! from a handful of known substrings (see [`parse_progress`]). Every line is
//! forwarded as a message regardless of whether it matched.

use super::{FlashEvents, FlashReporter, ProgressSink};
use crate::framing::LineFramer;
use log::debug;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Subdirectory of the install location holding the tool binaries.
pub const TOOL_SUBDIR: &str = "bin";

/// Chip family passed to esptool.
pub const TARGET_CHIP: &str = "esp32";

/// Flash offset of the application image.
pub const APP_OFFSET: &str = "0x10000";

/// Label for write progress.
pub const LABEL_WRITING: &str = "Writing firmware...";
/// Label while esptool syncs with the ROM bootloader.
pub const LABEL_CONNECTING: &str = "Connecting to ESP32...";
/// Label while the flash region is erased.
pub const LABEL_ERASING: &str = "Erasing flash...";
/// Label once the written data hash checks out.
pub const LABEL_VERIFYING: &str = "Verifying...";
/// Label for the final reset.
pub const LABEL_RESETTING: &str = "Resetting device...";

/// Prefix marking lines that came from the tool's stderr.
pub const STDERR_PREFIX: &str = "[stderr] ";

const READ_BUFFER_SIZE: usize = 4096;

#[allow(clippy::unwrap_used)] // Static pattern
static WRITING_AT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Writing at 0x[0-9a-fA-F]+\.\.\. \((\d+)\s*%\)").unwrap());

/// Parameters of one USB flash job.
#[derive(Debug, Clone)]
pub struct UsbFlashRequest {
    /// Application image to write.
    pub firmware: PathBuf,
    /// Serial port of the pendant (e.g. "/dev/ttyUSB0", "COM3").
    pub port: String,
    /// Baud rate for the transfer.
    pub baud: u32,
    /// Install location containing the `bin/` tool directory.
    pub tool_dir: PathBuf,
}

impl UsbFlashRequest {
    /// Build a request.
    pub fn new(
        firmware: impl Into<PathBuf>,
        port: impl Into<String>,
        baud: u32,
        tool_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            firmware: firmware.into(),
            port: port.into(),
            baud,
            tool_dir: tool_dir.into(),
        }
    }
}

/// esptool binary name for the host OS.
pub fn tool_binary_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "esptool-win.exe"
    } else if cfg!(target_os = "macos") {
        "esptool-macos"
    } else {
        "esptool-linux"
    }
}

/// Full path of the esptool binary under `tool_dir`.
pub fn tool_path(tool_dir: &Path) -> PathBuf {
    tool_dir.join(TOOL_SUBDIR).join(tool_binary_name())
}

/// Argument vector passed to esptool.
pub fn usb_arguments(request: &UsbFlashRequest) -> Vec<String> {
    vec![
        "--chip".to_string(),
        TARGET_CHIP.to_string(),
        "--port".to_string(),
        request.port.clone(),
        "--baud".to_string(),
        request.baud.to_string(),
        "write_flash".to_string(),
        APP_OFFSET.to_string(),
        request.firmware.display().to_string(),
    ]
}

/// Derive a normalised progress update from one line of esptool output.
pub fn parse_progress(line: &str) -> Option<(u8, &'static str)> {
    if let Some(caps) = WRITING_AT.captures(line) {
        let percent = u8::try_from(caps[1].parse::<u32>().ok()?.min(100)).ok()?;
        return Some((percent, LABEL_WRITING));
    }

    if line.contains("Connecting") {
        Some((0, LABEL_CONNECTING))
    } else if line.contains("Erasing flash") {
        Some((0, LABEL_ERASING))
    } else if line.contains("Hash of data verified") {
        Some((100, LABEL_VERIFYING))
    } else if line.contains("Hard resetting") {
        Some((100, LABEL_RESETTING))
    } else {
        None
    }
}

/// Spawn a USB flash job on the current tokio runtime.
pub fn flash_usb(request: UsbFlashRequest) -> FlashEvents {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_usb(request, tx));
    FlashEvents::new(rx)
}

/// Run a USB flash job to completion, reporting into `sink`.
pub async fn run_usb<S: ProgressSink>(request: UsbFlashRequest, sink: S) {
    let reporter = FlashReporter::new(sink);
    let tool = tool_path(&request.tool_dir);

    if let Err(e) = prepare_tool(&tool).await {
        reporter.error(&format!(
            "Flashing tool unavailable at {}: {e}",
            tool.display()
        ));
        return;
    }

    let args = usb_arguments(&request);
    reporter.message(&format!("Running: {} {}", tool.display(), args.join(" ")));

    let mut child = match Command::new(&tool)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            reporter.error(&format!("Failed to start flashing tool: {e}"));
            return;
        },
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::join!(
        pump(stdout, OutputChannel::Stdout, &reporter),
        pump(stderr, OutputChannel::Stderr, &reporter),
    );

    match child.wait().await {
        Ok(status) => match status.code() {
            Some(0) => reporter.complete("Firmware flashed successfully"),
            Some(code) => reporter.error(&format!("Flashing tool exited with code {code}")),
            None => reporter.error("Flashing tool was terminated by a signal"),
        },
        Err(e) => reporter.error(&format!("Failed to wait for flashing tool: {e}")),
    }
}

/// Check the tool exists and mark it executable.
async fn prepare_tool(path: &Path) -> std::io::Result<()> {
    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }

    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum OutputChannel {
    Stdout,
    Stderr,
}

async fn pump<R, S>(reader: Option<R>, channel: OutputChannel, reporter: &FlashReporter<S>)
where
    R: AsyncRead + Unpin,
    S: ProgressSink,
{
    let Some(mut reader) = reader else {
        return;
    };

    let mut framer = LineFramer::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in framer.feed(&buf[..n]) {
                    handle_line(&line, channel, reporter);
                }
            },
            Err(e) => {
                debug!("{channel:?} read failed: {e}");
                break;
            },
        }
    }

    // Unterminated tail goes out as a plain message.
    if let Some(rest) = framer.finish() {
        match channel {
            OutputChannel::Stdout => reporter.message(&rest),
            OutputChannel::Stderr => reporter.message(&format!("{STDERR_PREFIX}{rest}")),
        }
    }
}

fn handle_line<S: ProgressSink>(line: &str, channel: OutputChannel, reporter: &FlashReporter<S>) {
    if line.is_empty() {
        return;
    }
    match channel {
        OutputChannel::Stdout => {
            reporter.message(line);
            if let Some((percent, label)) = parse_progress(line) {
                reporter.progress(percent, label);
            }
        },
        OutputChannel::Stderr => reporter.message(&format!("{STDERR_PREFIX}{line}")),
    }
}
