//! Platform seams. The core drives hardware only through these traits so the
//! same state machines run on the ESP32 and on a desktop host.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use serde::Serialize;

use crate::{
    color::Rgb,
    error::{FetchError, FlashError, LightError, LinkError, SessionError},
    store::ConfigStore,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub mac_address: String,
    pub ip_address: String,
    pub ssid: String,
    pub rssi: i32,
}

/// Wireless network association, below the broker session.
pub trait WifiLink {
    /// Starts associating; completion is observed through [`WifiLink::is_up`].
    fn begin_join(&mut self, ssid: &str, password: &str) -> Result<(), LinkError>;
    fn is_up(&self) -> bool;
    fn disconnect(&mut self);
    fn info(&self) -> LinkInfo;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub trait MqttSession {
    /// Performs the broker handshake, replacing any previous session.
    fn connect(&mut self, options: &BrokerOptions) -> Result<(), SessionError>;
    fn is_connected(&mut self) -> bool;
    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError>;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError>;
    /// Next pending inbound message, without blocking.
    fn poll(&mut self) -> Option<InboundMessage>;
    /// Gives queued outbound messages `window_ms` to reach the broker.
    fn flush(&mut self, window_ms: u64);
}

/// Session flags shared with an MQTT client's event thread.
///
/// A drop after the session came up is sticky: clients that reconnect on
/// their own bring `up` back, but the session stays unhealthy until it is
/// replaced, so the owner re-runs the handshake and resubscribes.
#[derive(Debug, Default)]
pub struct SessionHealth {
    up: AtomicBool,
    lost: AtomicBool,
}

impl SessionHealth {
    pub fn mark_up(&self) {
        self.up.store(true, Ordering::Release);
    }

    pub fn mark_down(&self) {
        if self.up.swap(false, Ordering::AcqRel) {
            self.lost.store(true, Ordering::Release);
        }
    }

    /// The broker acknowledged the session at least once and it is up now.
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.is_up() && !self.lost.load(Ordering::Acquire)
    }
}

pub trait PixelStrip {
    fn len(&self) -> usize;
    fn set_pixel(&mut self, index: usize, color: Rgb);
    fn show(&mut self) -> Result<(), LightError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self) -> Result<(), LightError> {
        for index in 0..self.len() {
            self.set_pixel(index, Rgb::BLACK);
        }
        self.show()
    }
}

/// An HTTP response whose body is streamed on demand.
pub trait FirmwareDownload {
    fn status(&self) -> i32;
    fn content_length(&self) -> Option<u64>;
    /// Reads the next body chunk; `Ok(0)` marks the end of the stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FetchError>;
}

pub trait FirmwareSource {
    fn get(&mut self, url: &str) -> Result<Box<dyn FirmwareDownload>, FetchError>;
}

pub trait FlashUpdate {
    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError>;
    /// Seals the image. `Ok(false)` means the write was accepted but the image
    /// is not complete enough to boot.
    fn finalize(self: Box<Self>) -> Result<bool, FlashError>;
    fn abort(self: Box<Self>);
}

pub trait FlashTarget {
    /// Opens the inactive image region. `None` sizes it to the whole partition.
    fn begin(&mut self, size: Option<u64>) -> Result<Box<dyn FlashUpdate + '_>, FlashError>;
}

pub trait System {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&mut self, ms: u64);
    /// Reboots the device. Only mock implementations return.
    fn restart(&mut self);
    fn free_heap(&self) -> u32;
}

/// Mutable access to every platform service for one loop iteration.
pub struct Board<'a> {
    pub link: &'a mut dyn WifiLink,
    pub session: &'a mut dyn MqttSession,
    pub strip: &'a mut dyn PixelStrip,
    pub store: &'a mut dyn ConfigStore,
    pub firmware: &'a mut dyn FirmwareSource,
    pub flash: &'a mut dyn FlashTarget,
    pub system: &'a mut dyn System,
}

impl Board<'_> {
    /// Serializes `value` and publishes it on `topic`. Failures are logged and
    /// returned; callers treat publishing as best-effort.
    pub fn publish_json<T: Serialize>(&mut self, topic: &str, value: &T) -> Result<(), SessionError> {
        let body = serde_json::to_vec(value)
            .map_err(|err| SessionError::Transport(format!("encode failed: {err}")))?;
        self.session.publish(topic, &body).map_err(|err| {
            warn!("publish to {topic} failed: {err}");
            err
        })
    }

    /// Lets queued publishes drain for `flush_ms`, then reboots.
    pub fn restart_after(&mut self, flush_ms: u64) {
        info!("restarting in {flush_ms} ms");
        self.session.flush(flush_ms);
        self.system.restart();
    }
}
