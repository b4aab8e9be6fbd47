//! Firmware download-and-flash. Each attempt is single-shot: every milestone is
//! reported on the response channel and any failure leaves the running image
//! in place.

use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};

use crate::{
    board::{Board, FirmwareDownload, FlashTarget},
    types::{ResponsePayload, ResponseStatus},
};

const CHUNK_BYTES: usize = 1024;
const PROGRESS_LOG_BYTES: u64 = 64 * 1024;
/// Status reported when the request never produced an HTTP response.
const NO_RESPONSE: i32 = -1;

pub const MSG_STARTED: &str = "OTA update initiated";
pub const MSG_NO_SPACE: &str = "Not enough space";
pub const MSG_WRITE_FAILED: &str = "Error during update";
pub const MSG_NOT_FINISHED: &str = "Update not finished";
pub const MSG_COMPLETE: &str = "Update complete, rebooting";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaRequest {
    pub url: String,
    pub version: String,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Downloading,
    Writing { written: u64, expected: Option<u64> },
    Verifying,
    Succeeded,
    Failed(String),
}

impl UpdateState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }
}

struct Attempt {
    state: UpdateState,
}

impl Attempt {
    fn enter(&mut self, next: UpdateState) {
        match &next {
            UpdateState::Writing { .. } => {}
            UpdateState::Failed(reason) => warn!("ota: {:?} -> failed: {reason}", self.state),
            other => info!("ota: {:?} -> {other:?}", self.state),
        }
        self.state = next;
    }

    fn fail(&mut self, reason: impl Into<String>) -> UpdateState {
        self.enter(UpdateState::Failed(reason.into()));
        self.state.clone()
    }
}

/// Runs one update attempt and returns its terminal state. On success the
/// device has been told to restart before this returns.
pub fn run(
    board: &mut Board<'_>,
    response_topic: &str,
    flush_ms: u64,
    request: &OtaRequest,
) -> UpdateState {
    let mut attempt = Attempt {
        state: UpdateState::Idle,
    };
    info!("ota: updating to {} from {}", request.version, request.url);
    let _ = board.publish_json(
        response_topic,
        &ResponsePayload::new(ResponseStatus::Starting, MSG_STARTED),
    );

    let terminal = match download_and_flash(board, &mut attempt, request) {
        Ok(()) => {
            attempt.enter(UpdateState::Succeeded);
            let _ = board.publish_json(
                response_topic,
                &ResponsePayload::new(ResponseStatus::Success, MSG_COMPLETE),
            );
            board.restart_after(flush_ms);
            attempt.state
        }
        Err(message) => {
            let terminal = attempt.fail(message.clone());
            let _ = board.publish_json(response_topic, &ResponsePayload::failed(message));
            terminal
        }
    };

    debug_assert!(terminal.is_terminal());
    terminal
}

fn download_and_flash(
    board: &mut Board<'_>,
    attempt: &mut Attempt,
    request: &OtaRequest,
) -> Result<(), String> {
    attempt.enter(UpdateState::Downloading);

    let fetched = if request.url.is_empty() {
        warn!("ota: no firmware url given");
        None
    } else {
        board
            .firmware
            .get(&request.url)
            .map_err(|err| warn!("ota: request failed: {err}"))
            .ok()
    };
    let mut download = fetched.ok_or_else(|| http_error(NO_RESPONSE))?;

    let status = download.status();
    if status != 200 {
        return Err(http_error(status));
    }

    let expected = download.content_length();
    info!("ota: http 200, content length {expected:?}");

    stream_to_flash(
        &mut *download,
        &mut *board.flash,
        attempt,
        expected,
        request.sha256.as_deref(),
    )
}

fn stream_to_flash(
    download: &mut dyn FirmwareDownload,
    flash: &mut dyn FlashTarget,
    attempt: &mut Attempt,
    expected: Option<u64>,
    expected_sha256: Option<&str>,
) -> Result<(), String> {
    if expected == Some(0) {
        error!("ota: server declared an empty image");
        return Err(MSG_NO_SPACE.to_string());
    }

    let mut update = match flash.begin(expected) {
        Ok(update) => update,
        Err(err) => {
            error!("ota: cannot open update partition: {err}");
            return Err(MSG_NO_SPACE.to_string());
        }
    };

    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_BYTES];
    let mut written: u64 = 0;
    let mut next_progress = PROGRESS_LOG_BYTES;
    attempt.enter(UpdateState::Writing { written, expected });

    loop {
        let n = match download.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!("ota: download interrupted after {written} bytes: {err}");
                break;
            }
        };
        hasher.update(&buf[..n]);

        match update.write(&buf[..n]) {
            Ok(accepted) => written += accepted as u64,
            Err(err) => {
                error!("ota: flash write failed after {written} bytes: {err}");
                update.abort();
                return Err(MSG_WRITE_FAILED.to_string());
            }
        }
        attempt.state = UpdateState::Writing { written, expected };

        if written >= next_progress {
            debug!("ota: {written} bytes written");
            next_progress += PROGRESS_LOG_BYTES;
        }
    }

    attempt.enter(UpdateState::Verifying);
    match expected {
        Some(expected) if expected != written => {
            warn!("ota: wrote {written} of {expected} bytes; finalizing anyway");
        }
        _ => info!("ota: wrote {written} bytes"),
    }

    let digest = to_hex(&hasher.finalize());
    info!("ota: image sha256 {digest}");
    if let Some(want) = expected_sha256 {
        if !want.eq_ignore_ascii_case(&digest) {
            error!("ota: sha256 mismatch, expected {want}");
            update.abort();
            return Err(MSG_WRITE_FAILED.to_string());
        }
    }

    match update.finalize() {
        Ok(true) => Ok(()),
        Ok(false) => Err(MSG_NOT_FINISHED.to_string()),
        Err(err) => {
            error!("ota: finalize failed: {err}");
            Err(MSG_WRITE_FAILED.to_string())
        }
    }
}

fn http_error(code: i32) -> String {
    format!("HTTP error: {code}")
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
