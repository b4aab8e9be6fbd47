use log::{debug, info};

use crate::{board::Board, error::SessionError, types::StatusPayload};

/// Publishes status snapshots and tracks when the next periodic one is due.
#[derive(Debug, Clone)]
pub struct TelemetryReporter {
    device_id: String,
    firmware_version: String,
    status_topic: String,
    interval_ms: u64,
    last_publish_ms: u64,
}

impl TelemetryReporter {
    pub fn new(
        device_id: String,
        firmware_version: String,
        status_topic: String,
        interval_ms: u64,
    ) -> Self {
        Self {
            device_id,
            firmware_version,
            status_topic,
            interval_ms,
            last_publish_ms: 0,
        }
    }

    pub fn snapshot(&self, board: &Board<'_>) -> StatusPayload {
        let link = board.link.info();
        StatusPayload {
            device_id: self.device_id.clone(),
            mac_address: link.mac_address,
            ip_address: link.ip_address,
            wifi_ssid: link.ssid,
            rssi: link.rssi,
            firmware_version: self.firmware_version.clone(),
            uptime: board.system.now_ms() / 1_000,
            free_heap: board.system.free_heap(),
        }
    }

    /// Publishes one snapshot. The interval restarts whether or not the
    /// broker accepted it.
    pub fn publish(&mut self, board: &mut Board<'_>) -> Result<(), SessionError> {
        let status = self.snapshot(board);
        self.last_publish_ms = board.system.now_ms();
        board.publish_json(&self.status_topic, &status)?;
        info!(
            "status published (uptime {}s, heap {}, rssi {})",
            status.uptime, status.free_heap, status.rssi
        );
        Ok(())
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_publish_ms) > self.interval_ms
    }

    /// Publishes if more than the interval has elapsed since the last publish.
    pub fn publish_if_due(&mut self, board: &mut Board<'_>) -> bool {
        if !self.is_due(board.system.now_ms()) {
            return false;
        }
        debug!("periodic status due");
        // Failure is already logged by the board.
        let _ = self.publish(board);
        true
    }
}
