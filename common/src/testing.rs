//! Recording fakes for every platform seam.

use std::{cell::Cell, collections::VecDeque};

use serde_json::Value;

use crate::{
    board::{
        Board, BrokerOptions, FirmwareDownload, FirmwareSource, FlashTarget, FlashUpdate,
        InboundMessage, LinkInfo, MqttSession, PixelStrip, System, WifiLink,
    },
    color::Rgb,
    error::{FetchError, FlashError, LightError, LinkError, SessionError, StoreError},
    lights::STRIP_LEN,
    store::{ConfigStore, MemoryStore},
};

pub struct MockLink {
    up: Cell<bool>,
    joining: bool,
    polls: Cell<u32>,
    /// Readiness polls a join needs before the link comes up. `None` never joins.
    pub polls_to_join: Option<u32>,
    pub joins: Vec<(String, String)>,
    pub disconnects: u32,
    pub info: LinkInfo,
}

impl Default for MockLink {
    fn default() -> Self {
        Self {
            up: Cell::new(false),
            joining: false,
            polls: Cell::new(0),
            polls_to_join: Some(1),
            joins: Vec::new(),
            disconnects: 0,
            info: LinkInfo {
                mac_address: "24:6F:28:AA:BB:CC".to_string(),
                ip_address: "192.168.1.50".to_string(),
                ssid: "clinic".to_string(),
                rssi: -61,
            },
        }
    }
}

impl MockLink {
    pub fn set_up(&mut self, up: bool) {
        self.up.set(up);
        self.joining = false;
    }
}

impl WifiLink for MockLink {
    fn begin_join(&mut self, ssid: &str, password: &str) -> Result<(), LinkError> {
        self.joins.push((ssid.to_string(), password.to_string()));
        self.joining = true;
        self.polls.set(0);
        Ok(())
    }

    fn is_up(&self) -> bool {
        if !self.up.get() && self.joining {
            let polls = self.polls.get() + 1;
            self.polls.set(polls);
            if self.polls_to_join.is_some_and(|needed| polls >= needed) {
                self.up.set(true);
            }
        }
        self.up.get()
    }

    fn disconnect(&mut self) {
        self.disconnects += 1;
        self.set_up(false);
    }

    fn info(&self) -> LinkInfo {
        self.info.clone()
    }
}

#[derive(Default)]
pub struct MockSession {
    pub connected: bool,
    /// Scripted handshake results; an empty queue accepts.
    pub connect_results: VecDeque<Result<(), SessionError>>,
    pub connects: Vec<BrokerOptions>,
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, Vec<u8>)>,
    pub inbox: VecDeque<InboundMessage>,
    pub flushes: Vec<u64>,
    pub fail_publish: bool,
}

impl MockSession {
    pub fn push_inbound(&mut self, topic: &str, payload: &str) {
        self.inbox.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        });
    }

    pub fn published_on(&self, topic: &str) -> Vec<Value> {
        self.published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, body)| serde_json::from_slice(body).unwrap())
            .collect()
    }
}

impl MqttSession for MockSession {
    fn connect(&mut self, options: &BrokerOptions) -> Result<(), SessionError> {
        self.connects.push(options.clone());
        let result = self.connect_results.pop_front().unwrap_or(Ok(()));
        self.connected = result.is_ok();
        result
    }

    fn is_connected(&mut self) -> bool {
        self.connected
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        if !self.connected {
            return Err(SessionError::NotConnected);
        }
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        if self.fail_publish || !self.connected {
            return Err(SessionError::NotConnected);
        }
        self.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn poll(&mut self) -> Option<InboundMessage> {
        self.inbox.pop_front()
    }

    fn flush(&mut self, window_ms: u64) {
        self.flushes.push(window_ms);
    }
}

pub struct MockStrip {
    pub pixels: Vec<Rgb>,
    pub shows: usize,
}

impl Default for MockStrip {
    fn default() -> Self {
        Self {
            pixels: vec![Rgb::BLACK; STRIP_LEN],
            shows: 0,
        }
    }
}

impl PixelStrip for MockStrip {
    fn len(&self) -> usize {
        self.pixels.len()
    }

    fn set_pixel(&mut self, index: usize, color: Rgb) {
        self.pixels[index] = color;
    }

    fn show(&mut self) -> Result<(), LightError> {
        self.shows += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct MockStore {
    pub inner: MemoryStore,
    pub fail_writes: bool,
    /// Keys whose writes fail even when `fail_writes` is off.
    pub fail_keys: Vec<&'static str>,
}

impl MockStore {
    fn check_write(&self, key: &str) -> Result<(), StoreError> {
        if self.fail_writes || self.fail_keys.iter().any(|failing| *failing == key) {
            return Err(StoreError::Backend("flash worn out".to_string()));
        }
        Ok(())
    }
}

impl ConfigStore for MockStore {
    fn get_str(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get_str(key)
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_write(key)?;
        self.inner.put_str(key, value)
    }

    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StoreError> {
        self.inner.get_i32(key)
    }

    fn put_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError> {
        self.check_write(key)?;
        self.inner.put_i32(key, value)
    }
}

#[derive(Debug, Clone)]
pub struct MockDownload {
    pub status: i32,
    pub content_length: Option<u64>,
    pub body: Vec<u8>,
    pub chunk: usize,
    /// Fails the read that would start at this offset.
    pub fail_at: Option<usize>,
    position: usize,
}

impl MockDownload {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_length: Some(body.len() as u64),
            body,
            chunk: 256,
            fail_at: None,
            position: 0,
        }
    }

    pub fn with_status(status: i32) -> Self {
        Self {
            status,
            content_length: Some(0),
            ..Self::ok(Vec::new())
        }
    }
}

impl FirmwareDownload for MockDownload {
    fn status(&self) -> i32 {
        self.status
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FetchError> {
        if self.fail_at == Some(self.position) {
            return Err(FetchError::Read("connection reset".to_string()));
        }
        let end = self
            .body
            .len()
            .min(self.position + self.chunk.min(buf.len()));
        let n = end - self.position;
        buf[..n].copy_from_slice(&self.body[self.position..end]);
        self.position = end;
        Ok(n)
    }
}

#[derive(Default)]
pub struct MockFirmware {
    pub response: Option<Result<MockDownload, FetchError>>,
    pub requests: Vec<String>,
}

impl FirmwareSource for MockFirmware {
    fn get(&mut self, url: &str) -> Result<Box<dyn FirmwareDownload>, FetchError> {
        self.requests.push(url.to_string());
        match self.response.clone() {
            Some(Ok(download)) => Ok(Box::new(download)),
            Some(Err(err)) => Err(err),
            None => Err(FetchError::Transport(format!("no route to {url}"))),
        }
    }
}

pub struct MockFlash {
    pub capacity: u64,
    pub begins: Vec<Option<u64>>,
    pub image: Vec<u8>,
    /// Caps the bytes accepted per write call.
    pub max_write: Option<usize>,
    pub finalize_result: Result<bool, FlashError>,
    pub finalized: bool,
    pub aborted: bool,
}

impl Default for MockFlash {
    fn default() -> Self {
        Self {
            capacity: 1 << 20,
            begins: Vec::new(),
            image: Vec::new(),
            max_write: None,
            finalize_result: Ok(true),
            finalized: false,
            aborted: false,
        }
    }
}

struct MockFlashUpdate<'a> {
    flash: &'a mut MockFlash,
}

impl FlashTarget for MockFlash {
    fn begin(&mut self, size: Option<u64>) -> Result<Box<dyn FlashUpdate + '_>, FlashError> {
        self.begins.push(size);
        let requested = size.unwrap_or(self.capacity);
        if requested > self.capacity {
            return Err(FlashError::InsufficientSpace {
                requested,
                available: self.capacity,
            });
        }
        Ok(Box::new(MockFlashUpdate { flash: self }))
    }
}

impl FlashUpdate for MockFlashUpdate<'_> {
    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError> {
        let n = self.flash.max_write.map_or(data.len(), |max| max.min(data.len()));
        self.flash.image.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn finalize(self: Box<Self>) -> Result<bool, FlashError> {
        self.flash.finalized = true;
        self.flash.finalize_result.clone()
    }

    fn abort(self: Box<Self>) {
        self.flash.aborted = true;
    }
}

pub struct MockSystem {
    pub now_ms: u64,
    pub slept: Vec<u64>,
    pub restarts: u32,
    pub heap: u32,
}

impl Default for MockSystem {
    fn default() -> Self {
        Self {
            now_ms: 0,
            slept: Vec::new(),
            restarts: 0,
            heap: 180_000,
        }
    }
}

impl System for MockSystem {
    fn now_ms(&self) -> u64 {
        self.now_ms
    }

    fn sleep_ms(&mut self, ms: u64) {
        self.slept.push(ms);
        self.now_ms += ms;
    }

    fn restart(&mut self) {
        self.restarts += 1;
    }

    fn free_heap(&self) -> u32 {
        self.heap
    }
}

/// Owns one of each fake and lends them out as a [`Board`].
#[derive(Default)]
pub struct Rig {
    pub link: MockLink,
    pub session: MockSession,
    pub strip: MockStrip,
    pub store: MockStore,
    pub firmware: MockFirmware,
    pub flash: MockFlash,
    pub system: MockSystem,
}

impl Rig {
    /// A rig whose link and broker session are already established.
    pub fn online() -> Self {
        let mut rig = Self::default();
        rig.link.set_up(true);
        rig.session.connected = true;
        rig
    }

    pub fn board(&mut self) -> Board<'_> {
        Board {
            link: &mut self.link,
            session: &mut self.session,
            strip: &mut self.strip,
            store: &mut self.store,
            firmware: &mut self.firmware,
            flash: &mut self.flash,
            system: &mut self.system,
        }
    }
}
