//! Wi-Fi (OTA) flashing over the device's HTTP update endpoint.
//!
//! The firmware is wrapped in a single-part `multipart/form-data` body and
//! POSTed to `http://<device>/update`. The body is handed to the HTTP stack
//! as a pull-based stream of [`CHUNK_SIZE`] pieces: the next chunk is only
//! produced once the connection has accepted the previous one, so a slow
//! link throttles the upload instead of buffering the whole image.
//!
//! The device reboots as soon as it has accepted the image, frequently
//! before its response reaches us. A connection reset, broken pipe or a
//! connection closed without a response after the complete body was handed
//! over is therefore reported as success.

use super::{FlashEvents, FlashReporter, ProgressSink};
use futures::stream;
use log::debug;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Upload chunk size.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Default request timeout; covers the device-side erase/write cycle.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Form field carrying the image.
pub const FIELD_NAME: &str = "firmware";

/// Progress label for the upload.
pub const LABEL_UPLOADING: &str = "Uploading firmware...";

/// Completion text used when the device answers with an empty body.
pub const DEFAULT_SUCCESS: &str = "Firmware uploaded successfully, device is rebooting";

/// Parameters of one OTA flash job.
#[derive(Debug, Clone)]
pub struct OtaFlashRequest {
    /// Application image to upload.
    pub firmware: PathBuf,
    /// Device address, `host` or `host:port`.
    pub address: String,
    /// Whole-request timeout.
    pub timeout: Duration,
}

impl OtaFlashRequest {
    /// Build a request with the default timeout.
    pub fn new(firmware: impl Into<PathBuf>, address: impl Into<String>) -> Self {
        Self {
            firmware: firmware.into(),
            address: address.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Update endpoint URL.
    pub fn url(&self) -> String {
        let host = self
            .address
            .trim()
            .trim_start_matches("http://")
            .trim_end_matches('/');
        format!("http://{host}/update")
    }
}

/// A `multipart/form-data` body holding one file part.
#[derive(Debug, Clone)]
pub struct MultipartBody {
    boundary: String,
    header: Vec<u8>,
    firmware: Vec<u8>,
    footer: Vec<u8>,
}

impl MultipartBody {
    /// Wrap `firmware` using a boundary derived from the current time.
    pub fn new(filename: &str, firmware: Vec<u8>) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        Self::with_boundary(format!("----PendantFirmware{millis:x}"), filename, firmware)
    }

    /// Wrap `firmware` using an explicit boundary token.
    pub fn with_boundary(boundary: String, filename: &str, firmware: Vec<u8>) -> Self {
        let header = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"{FIELD_NAME}\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        let footer = format!("\r\n--{boundary}--\r\n").into_bytes();
        Self {
            boundary,
            header,
            firmware,
            footer,
        }
    }

    /// Boundary token.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value of the `Content-Type` request header.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Total body length in bytes.
    pub fn len(&self) -> usize {
        self.header.len() + self.firmware.len() + self.footer.len()
    }

    /// Whether the body is empty (never true for a built body).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length of the part header preceding the firmware bytes.
    pub fn header_len(&self) -> usize {
        self.header.len()
    }

    /// Upload percentage once `sent` body bytes have been handed over.
    pub fn progress_after(&self, sent: usize) -> u8 {
        upload_percent(sent, self.header.len(), self.firmware.len())
    }

    /// Concatenate header, firmware and footer.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = self.header;
        out.reserve(self.firmware.len() + self.footer.len());
        out.extend_from_slice(&self.firmware);
        out.extend_from_slice(&self.footer);
        out
    }
}

/// Percent of the firmware payload covered by `sent` body bytes, 0..=100.
fn upload_percent(sent: usize, header_len: usize, firmware_len: usize) -> u8 {
    let past_header = sent.saturating_sub(header_len);
    if firmware_len == 0 {
        return if sent >= header_len { 100 } else { 0 };
    }
    let percent = (past_header.min(firmware_len) as u128 * 100) / firmware_len as u128;
    u8::try_from(percent).unwrap_or(100)
}

/// Spawn an OTA flash job on the current tokio runtime.
pub fn flash_ota(request: OtaFlashRequest) -> FlashEvents {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_ota(request, tx));
    FlashEvents::new(rx)
}

/// Run an OTA flash job to completion, reporting into `sink`.
pub async fn run_ota<S: ProgressSink + 'static>(request: OtaFlashRequest, sink: S) {
    let reporter = Arc::new(FlashReporter::new(sink));

    let firmware = match tokio::fs::read(&request.firmware).await {
        Ok(data) => data,
        Err(e) => {
            reporter.error(&format!(
                "Failed to read firmware {}: {e}",
                request.firmware.display()
            ));
            return;
        },
    };

    let body = MultipartBody::new(&file_name(&request.firmware), firmware);
    let url = request.url();
    reporter.message(&format!(
        "Uploading {} bytes to {url}",
        body.len() - body.header_len()
    ));

    let client = match reqwest::Client::builder().timeout(request.timeout).build() {
        Ok(client) => client,
        Err(e) => {
            reporter.error(&format!("Failed to create HTTP client: {e}"));
            return;
        },
    };

    let content_type = body.content_type();
    let total = body.len();
    let handed_over = Arc::new(AtomicBool::new(false));
    let chunks = body_stream(body, Arc::clone(&reporter), Arc::clone(&handed_over));

    let result = client
        .post(&url)
        .header(CONTENT_TYPE, content_type)
        .header(CONTENT_LENGTH, total)
        .body(reqwest::Body::wrap_stream(chunks))
        .send()
        .await;

    match result {
        Ok(response) => {
            let status = response.status();
            let text = response.text().await.unwrap_or_else(|e| {
                debug!("Failed to read update response body: {e}");
                String::new()
            });
            let text = text.trim();
            if status.is_success() {
                reporter.progress(100, LABEL_UPLOADING);
                reporter.complete(if text.is_empty() { DEFAULT_SUCCESS } else { text });
            } else {
                reporter.error(&format!("Device rejected firmware: HTTP {status}: {text}"));
            }
        },
        Err(e) if e.is_timeout() => {
            reporter.error(&format!(
                "Upload timed out after {}s",
                request.timeout.as_secs()
            ));
        },
        Err(e) if is_connection_dropped(&e) && handed_over.load(Ordering::Acquire) => {
            debug!("Connection dropped after upload, assuming device reboot: {e}");
            reporter.progress(100, LABEL_UPLOADING);
            reporter.complete(DEFAULT_SUCCESS);
        },
        Err(e) => reporter.error(&format!("Upload failed: {e}")),
    }
}

/// Pull-based chunk stream over the body.
///
/// Progress for a chunk is reported when the HTTP stack pulls the next
/// one; the final 100% is reported by the caller once the request ends.
fn body_stream<S: ProgressSink + 'static>(
    body: MultipartBody,
    reporter: Arc<FlashReporter<S>>,
    handed_over: Arc<AtomicBool>,
) -> impl futures::Stream<Item = io::Result<Vec<u8>>> + Send + 'static {
    let header_len = body.header_len();
    let firmware_len = body.len() - header_len - body.footer.len();
    let bytes = body.into_bytes();

    stream::unfold(0usize, move |offset| {
        let end = (offset + CHUNK_SIZE).min(bytes.len());
        let item = (offset < bytes.len()).then(|| bytes[offset..end].to_vec());
        if item.is_some() {
            if offset > 0 {
                reporter.progress(
                    upload_percent(offset, header_len, firmware_len),
                    LABEL_UPLOADING,
                );
            }
            if end == bytes.len() {
                handed_over.store(true, Ordering::Release);
            }
        }
        async move { item.map(|chunk| (Ok(chunk), end)) }
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| "firmware.bin".to_string(), |n| n.to_string_lossy().into_owned())
}

/// Whether the error chain shows the peer going away: a reset, a broken
/// pipe, or a close before any response arrived.
fn is_connection_dropped(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        if e
            .downcast_ref::<hyper::Error>()
            .is_some_and(hyper::Error::is_incomplete_message)
        {
            return true;
        }
        current = e.source();
    }
    false
}
