use std::{
    collections::VecDeque,
    fs::{self, File},
    io::{BufWriter, ErrorKind, Read, Write},
    net::UdpSocket,
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{Client, Connection, Event, Incoming, MqttOptions, QoS};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use dispenser_common::{
    error::{FetchError, FlashError, LightError, LinkError, SessionError, StoreError},
    lights::STRIP_LEN,
    Board, BrokerOptions, ConfigStore, Device, FirmwareDownload, FirmwareSource, FlashTarget,
    FlashUpdate, InboundMessage, LinkInfo, MqttSession, PixelStrip, Rgb, RuntimeConfig, System,
    WifiLink,
};

const DEFAULT_DATA_DIR: &str = "./.dispenser";
const STORE_FILE: &str = "medication.json";
/// Size of one application slot in the default 4 MB partition table.
const DEFAULT_OTA_CAPACITY: u64 = 1_966_080;
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_WINDOW: Duration = Duration::from_millis(20);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const MQTT_MAX_PACKET_BYTES: usize = 10 * 1024;

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = runtime_config_from(|key| std::env::var(key).ok());
    let data_dir = std::env::var("DISPENSER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));
    let ota_capacity = std::env::var("DISPENSER_OTA_CAPACITY")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_OTA_CAPACITY);

    info!(
        "host dispenser `{}` using data dir {}",
        config.device.device_id,
        data_dir.display()
    );

    let mut link = HostLink::default();
    let mut session = HostSession::default();
    let mut strip = LoggingStrip::default();
    let mut store = JsonFileStore::open(data_dir.join(STORE_FILE))
        .context("failed to open settings store")?;
    let mut firmware = HttpFirmwareSource::new().context("failed to build http client")?;
    let mut flash = StagingFlash::new(data_dir.join("ota"), ota_capacity);
    let mut system = HostSystem::new();

    let mut board = Board {
        link: &mut link,
        session: &mut session,
        strip: &mut strip,
        store: &mut store,
        firmware: &mut firmware,
        flash: &mut flash,
        system: &mut system,
    };

    let mut device = Device::new(config);
    device.run(&mut board);
    Ok(())
}

/// Builds the runtime config from environment-style lookups over the defaults.
fn runtime_config_from(var: impl Fn(&str) -> Option<String>) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.device.firmware_version = env!("CARGO_PKG_VERSION").to_string();

    if let Some(id) = var("DEVICE_ID") {
        config.device.device_id = id;
    }
    if let Some(base) = var("MQTT_BASE_TOPIC") {
        config.device.base_topic = base;
    }
    if let Some(ssid) = var("WIFI_SSID") {
        config.network.wifi_ssid = ssid;
    }
    if let Some(pass) = var("WIFI_PASS") {
        config.network.wifi_pass = pass;
    }
    if let Some(host) = var("MQTT_HOST") {
        config.network.mqtt_host = host;
    }
    if let Some(port) = var("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.network.mqtt_port = port;
    }
    if let Some(user) = var("MQTT_USER") {
        config.network.mqtt_user = user;
    }
    if let Some(pass) = var("MQTT_PASS") {
        config.network.mqtt_pass = pass;
    }

    config.sanitize();
    config
}

/// The host is always on a network; joining only records the requested SSID.
#[derive(Default)]
struct HostLink {
    ssid: String,
}

impl WifiLink for HostLink {
    fn begin_join(&mut self, ssid: &str, _password: &str) -> Result<(), LinkError> {
        debug!("host link: pretending to join `{ssid}`");
        self.ssid = ssid.to_string();
        Ok(())
    }

    fn is_up(&self) -> bool {
        true
    }

    fn disconnect(&mut self) {}

    fn info(&self) -> LinkInfo {
        LinkInfo {
            mac_address: "00:00:00:00:00:00".to_string(),
            ip_address: local_ip().unwrap_or_else(|| "0.0.0.0".to_string()),
            ssid: self.ssid.clone(),
            rssi: 0,
        }
    }
}

fn local_ip() -> Option<String> {
    // Connecting a UDP socket sends nothing; it only selects the outbound interface.
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

#[derive(Default)]
struct HostSession {
    client: Option<Client>,
    connection: Option<Connection>,
    connected: bool,
    inbox: VecDeque<InboundMessage>,
}

impl HostSession {
    fn drop_session(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.try_disconnect();
        }
        self.connection = None;
        self.connected = false;
    }

    /// Drives the client's event loop for up to `window`, queueing inbound
    /// publishes. Returns early once a message is queued if `until_message`.
    fn pump(&mut self, window: Duration, until_message: bool) {
        let deadline = Instant::now() + window;
        loop {
            let Some(connection) = self.connection.as_mut() else {
                return;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = if remaining.is_zero() {
                match connection.try_recv() {
                    Ok(event) => event,
                    Err(_) => return,
                }
            } else {
                match connection.recv_timeout(remaining) {
                    Ok(event) => event,
                    Err(_) => return,
                }
            };

            match event {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    self.inbox.push_back(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                    if until_message {
                        return;
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    warn!("broker closed the session");
                    self.drop_session();
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt connection error: {err}");
                    self.drop_session();
                    return;
                }
            }
        }
    }
}

impl MqttSession for HostSession {
    fn connect(&mut self, options: &BrokerOptions) -> Result<(), SessionError> {
        self.drop_session();

        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
        mqtt_options.set_keep_alive(Duration::from_secs(15));
        mqtt_options.set_clean_session(true);
        mqtt_options.set_max_packet_size(MQTT_MAX_PACKET_BYTES, MQTT_MAX_PACKET_BYTES);
        if let Some((user, pass)) = &options.credentials {
            mqtt_options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut connection) = Client::new(mqtt_options, 64);
        let deadline = Instant::now() + CONNACK_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::Timeout);
            }
            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Incoming::ConnAck(ack)))) => {
                    debug!("connack: {ack:?}");
                    break;
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(SessionError::Transport(err.to_string())),
                Err(_) => return Err(SessionError::Timeout),
            }
        }

        info!("mqtt connected to {}:{}", options.host, options.port);
        self.client = Some(client);
        self.connection = Some(connection);
        self.connected = true;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.pump(Duration::ZERO, false);
        self.connected
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        let client = self.client.as_ref().ok_or(SessionError::NotConnected)?;
        client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| SessionError::Transport(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        let client = self.client.as_ref().ok_or(SessionError::NotConnected)?;
        client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| SessionError::Transport(err.to_string()))?;
        self.pump(Duration::ZERO, false);
        Ok(())
    }

    fn poll(&mut self) -> Option<InboundMessage> {
        if self.inbox.is_empty() {
            self.pump(POLL_WINDOW, true);
        }
        self.inbox.pop_front()
    }

    fn flush(&mut self, window_ms: u64) {
        self.pump(Duration::from_millis(window_ms), false);
    }
}

/// Keeps the frame in memory and logs it on every show.
struct LoggingStrip {
    pixels: Vec<Rgb>,
}

impl Default for LoggingStrip {
    fn default() -> Self {
        Self {
            pixels: vec![Rgb::BLACK; STRIP_LEN],
        }
    }
}

impl PixelStrip for LoggingStrip {
    fn len(&self) -> usize {
        self.pixels.len()
    }

    fn set_pixel(&mut self, index: usize, color: Rgb) {
        if let Some(pixel) = self.pixels.get_mut(index) {
            *pixel = color;
        }
    }

    fn show(&mut self) -> Result<(), LightError> {
        let frame: Vec<String> = self.pixels.iter().map(|p| p.to_hex()).collect();
        info!("strip: {}", frame.join(" "));
        Ok(())
    }
}

/// Key/value settings kept as one JSON object, rewritten on every put.
struct JsonFileStore {
    path: PathBuf,
    entries: Map<String, Value>,
}

impl JsonFileStore {
    fn open(path: PathBuf) -> anyhow::Result<Self> {
        let entries = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("corrupt settings file {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, entries })
    }

    fn persist(&self) -> Result<(), StoreError> {
        let write = || -> anyhow::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&self.path, serde_json::to_vec_pretty(&self.entries)?)?;
            Ok(())
        };
        write().map_err(|err| StoreError::Backend(format!("{err:#}")))
    }
}

impl ConfigStore for JsonFileStore {
    fn get_str(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(other) => Err(StoreError::Backend(format!(
                "key `{key}` is not a string: {other}"
            ))),
        }
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), Value::String(value.to_string()));
        self.persist()
    }

    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StoreError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(value) => value
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| StoreError::Backend(format!("key `{key}` is not an i32: {value}"))),
        }
    }

    fn put_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), Value::from(value));
        self.persist()
    }
}

struct HttpFirmwareSource {
    client: reqwest::blocking::Client,
}

impl HttpFirmwareSource {
    fn new() -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

struct HttpDownload {
    response: reqwest::blocking::Response,
}

impl FirmwareSource for HttpFirmwareSource {
    fn get(&mut self, url: &str) -> Result<Box<dyn FirmwareDownload>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| FetchError::Transport(format!("{err:#}")))?;
        Ok(Box::new(HttpDownload { response }))
    }
}

impl FirmwareDownload for HttpDownload {
    fn status(&self) -> i32 {
        i32::from(self.response.status().as_u16())
    }

    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FetchError> {
        self.response
            .read(buf)
            .map_err(|err| FetchError::Read(err.to_string()))
    }
}

/// Writes images to `<dir>/firmware.bin.part` and promotes them on finalize.
struct StagingFlash {
    dir: PathBuf,
    capacity: u64,
}

impl StagingFlash {
    fn new(dir: PathBuf, capacity: u64) -> Self {
        Self { dir, capacity }
    }
}

struct StagedImage {
    writer: BufWriter<File>,
    part_path: PathBuf,
    final_path: PathBuf,
    expected: Option<u64>,
    written: u64,
    capacity: u64,
}

impl FlashTarget for StagingFlash {
    fn begin(&mut self, size: Option<u64>) -> Result<Box<dyn FlashUpdate + '_>, FlashError> {
        if let Some(requested) = size.filter(|requested| *requested > self.capacity) {
            return Err(FlashError::InsufficientSpace {
                requested,
                available: self.capacity,
            });
        }

        fs::create_dir_all(&self.dir).map_err(|err| FlashError::Begin(err.to_string()))?;
        let part_path = self.dir.join("firmware.bin.part");
        let file = File::create(&part_path).map_err(|err| FlashError::Begin(err.to_string()))?;

        Ok(Box::new(StagedImage {
            writer: BufWriter::new(file),
            part_path,
            final_path: self.dir.join("firmware.bin"),
            expected: size,
            written: 0,
            capacity: self.capacity,
        }))
    }
}

impl FlashUpdate for StagedImage {
    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError> {
        let room = self.capacity.saturating_sub(self.written);
        if data.len() as u64 > room {
            return Err(FlashError::Write(format!(
                "image exceeds {} byte partition",
                self.capacity
            )));
        }
        self.writer
            .write_all(data)
            .map_err(|err| FlashError::Write(err.to_string()))?;
        self.written += data.len() as u64;
        Ok(data.len())
    }

    fn finalize(mut self: Box<Self>) -> Result<bool, FlashError> {
        self.writer
            .flush()
            .map_err(|err| FlashError::Finalize(err.to_string()))?;

        if self.written == 0 {
            let _ = fs::remove_file(&self.part_path);
            return Ok(false);
        }
        if let Some(expected) = self.expected.filter(|expected| *expected != self.written) {
            let _ = fs::remove_file(&self.part_path);
            return Err(FlashError::Finalize(format!(
                "expected {expected} bytes, got {}",
                self.written
            )));
        }

        fs::rename(&self.part_path, &self.final_path)
            .map_err(|err| FlashError::Finalize(err.to_string()))?;
        info!(
            "staged {} byte image at {}",
            self.written,
            self.final_path.display()
        );
        Ok(true)
    }

    fn abort(self: Box<Self>) {
        let part_path = self.part_path.clone();
        drop(self);
        if let Err(err) = fs::remove_file(&part_path) {
            debug!("could not remove {}: {err}", part_path.display());
        }
    }
}

struct HostSystem {
    started: Instant,
}

impl HostSystem {
    fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl System for HostSystem {
    fn now_ms(&self) -> u64 {
        self.started
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    fn sleep_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn restart(&mut self) {
        warn!("restart requested; re-executing");
        restart_process();
    }

    fn free_heap(&self) -> u32 {
        0
    }
}

#[cfg(unix)]
fn restart_process() {
    use std::os::unix::process::CommandExt;

    let err = match std::env::current_exe() {
        Ok(exe) => std::process::Command::new(exe)
            .args(std::env::args_os().skip(1))
            .exec(),
        Err(err) => err,
    };
    warn!("re-exec failed: {err}; exiting");
    std::process::exit(0);
}

#[cfg(not(unix))]
fn restart_process() {
    std::process::exit(0);
}
