//! Firmware flash engines.
//!
//! Two engines push firmware onto a pendant:
//!
//! - [`usb`]: drives an external esptool binary over a USB serial port
//! - [`ota`]: uploads the image to the device's `/update` HTTP endpoint
//!
//! Both report through the same [`ProgressSink`] contract so a caller can
//! drive identical UI regardless of transport. A job emits any number of
//! `message`/`progress` notifications followed by exactly one terminal
//! `complete` or `error`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pendant_link::flash::{FlashEvent, usb::{UsbFlashRequest, flash_usb}};
//!
//! # async fn run() -> pendant_link::Result<()> {
//! let request = UsbFlashRequest::new("firmware.bin", "/dev/ttyUSB0", 460800, "/opt/pendant");
//! let summary = flash_usb(request)
//!     .wait(|event| {
//!         if let FlashEvent::Progress { percent, label } = event {
//!             println!("{percent:3}% {label}");
//!         }
//!     })
//!     .await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

pub mod ota;
pub mod usb;

use crate::error::{Error, Result};
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// One notification from a running flash job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    /// Free-form log line (tool output, invocation echo).
    Message(String),
    /// Normalised progress.
    Progress {
        /// Percent complete, 0..=100.
        percent: u8,
        /// Phase label, e.g. "Writing firmware...".
        label: String,
    },
    /// Terminal success with a human-readable summary.
    Complete(String),
    /// Terminal failure with the reason.
    Error(String),
}

impl FlashEvent {
    /// Whether this event ends the job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error(_))
    }
}

/// Receiver side of the flash notification contract.
pub trait ProgressSink: Send + Sync {
    /// Informational line.
    fn message(&self, text: &str);
    /// Progress update.
    fn progress(&self, percent: u8, label: &str);
    /// Job finished successfully.
    fn complete(&self, summary: &str);
    /// Job failed.
    fn error(&self, reason: &str);
}

impl ProgressSink for mpsc::UnboundedSender<FlashEvent> {
    fn message(&self, text: &str) {
        let _ = self.send(FlashEvent::Message(text.to_string()));
    }

    fn progress(&self, percent: u8, label: &str) {
        let _ = self.send(FlashEvent::Progress {
            percent,
            label: label.to_string(),
        });
    }

    fn complete(&self, summary: &str) {
        let _ = self.send(FlashEvent::Complete(summary.to_string()));
    }

    fn error(&self, reason: &str) {
        let _ = self.send(FlashEvent::Error(reason.to_string()));
    }
}

/// Wraps a sink and guarantees a single terminal event.
///
/// Once `complete` or `error` has been forwarded, every later call is
/// dropped. This covers races such as a timeout firing while a late
/// response is being handled.
pub struct FlashReporter<S> {
    sink: S,
    finished: AtomicBool,
}

impl<S: ProgressSink> FlashReporter<S> {
    /// Wrap `sink`.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            finished: AtomicBool::new(false),
        }
    }

    /// Whether a terminal event has been sent.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Forward a message.
    pub fn message(&self, text: &str) {
        if self.is_finished() {
            return;
        }
        debug!("{text}");
        self.sink.message(text);
    }

    /// Forward a progress update.
    pub fn progress(&self, percent: u8, label: &str) {
        if self.is_finished() {
            return;
        }
        trace!("{percent}% {label}");
        self.sink.progress(percent.min(100), label);
    }

    /// Forward the success event, unless the job already ended.
    pub fn complete(&self, summary: &str) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("{summary}");
        self.sink.complete(summary);
    }

    /// Forward the failure event, unless the job already ended.
    pub fn error(&self, reason: &str) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("{reason}");
        self.sink.error(reason);
    }
}

/// Lifecycle of a flash job as seen by its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    /// No event received yet.
    Pending,
    /// Events are flowing.
    Running,
    /// Ended with `complete`.
    Completed,
    /// Ended with `error`.
    Failed,
}

/// Handle to a spawned flash job's event stream.
pub struct FlashEvents {
    rx: mpsc::UnboundedReceiver<FlashEvent>,
    state: FlashState,
}

impl FlashEvents {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<FlashEvent>) -> Self {
        Self {
            rx,
            state: FlashState::Pending,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FlashState {
        self.state
    }

    /// Next event, or `None` once the job has ended and the stream drained.
    pub async fn recv(&mut self) -> Option<FlashEvent> {
        let event = self.rx.recv().await?;
        self.state = match &event {
            FlashEvent::Complete(_) => FlashState::Completed,
            FlashEvent::Error(_) => FlashState::Failed,
            _ => FlashState::Running,
        };
        Some(event)
    }

    /// Drive the job to its terminal event.
    ///
    /// `handler` sees every event, terminal one included.
    pub async fn wait<F>(mut self, mut handler: F) -> Result<String>
    where
        F: FnMut(&FlashEvent),
    {
        while let Some(event) = self.recv().await {
            handler(&event);
            match event {
                FlashEvent::Complete(summary) => return Ok(summary),
                FlashEvent::Error(reason) => return Err(Error::Flash(reason)),
                _ => {},
            }
        }
        Err(Error::Flash(
            "flash job ended without reporting a result".to_string(),
        ))
    }
}
