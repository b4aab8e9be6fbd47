use core::convert::TryInto;
use std::{
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::Method,
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::{EspOta, EspOtaUpdate},
    wifi::EspWifi,
};
use log::{info, warn};

use dispenser_common::{
    error::{FetchError, FlashError, LinkError, SessionError, StoreError},
    lights::STRIP_LEN,
    store::NAMESPACE,
    Board, BrokerOptions, ConfigStore, Device, FirmwareDownload, FirmwareSource, FlashTarget,
    FlashUpdate, InboundMessage, LinkInfo, MqttSession, RuntimeConfig, SessionHealth, System,
    WifiLink,
};

use crate::strip::Ws2812Strip;

const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MQTT_CONNECT_POLL: Duration = Duration::from_millis(100);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const NVS_STR_BUF_BYTES: usize = 128;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem, rmt, pins, ..
    } = Peripherals::take()?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let config = compiled_config();
    info!(
        "dispenser `{}` firmware {}",
        config.device.device_id, config.device.firmware_version
    );

    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition.clone()))
        .context("failed to create wifi driver")?;
    let mut link = EspWifiLink::new(wifi);
    let mut session = EspMqttSession::default();
    let mut strip = Ws2812Strip::new(rmt.channel0, pins.gpio5, STRIP_LEN)?;
    let mut store = NvsStore::open(nvs_partition)?;
    let mut firmware = EspFirmwareSource;
    let mut flash = EspFlash::new()?;
    let mut system = EspSystem;

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

    // Only reached if esp_restart returned.
    Err(anyhow!("device loop exited without restarting"))
}

/// Defaults baked in at build time; stored NVS values take precedence at boot.
fn compiled_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.device.firmware_version = env!("CARGO_PKG_VERSION").to_string();

    if let Some(id) = option_env!("DEVICE_ID") {
        config.device.device_id = id.to_string();
    }
    if let Some(base) = option_env!("MQTT_BASE_TOPIC") {
        config.device.base_topic = base.to_string();
    }
    if let Some(ssid) = option_env!("WIFI_SSID") {
        config.network.wifi_ssid = ssid.to_string();
    }
    if let Some(pass) = option_env!("WIFI_PASS") {
        config.network.wifi_pass = pass.to_string();
    }
    if let Some(host) = option_env!("MQTT_HOST") {
        config.network.mqtt_host = host.to_string();
    }
    if let Some(port) = option_env!("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.network.mqtt_port = port;
    }
    if let Some(user) = option_env!("MQTT_USER") {
        config.network.mqtt_user = user.to_string();
    }
    if let Some(pass) = option_env!("MQTT_PASS") {
        config.network.mqtt_pass = pass.to_string();
    }

    config.sanitize();
    config
}

struct EspWifiLink {
    wifi: EspWifi<'static>,
    ssid: String,
}

impl EspWifiLink {
    fn new(wifi: EspWifi<'static>) -> Self {
        Self {
            wifi,
            ssid: String::new(),
        }
    }
}

impl WifiLink for EspWifiLink {
    fn begin_join(&mut self, ssid: &str, password: &str) -> Result<(), LinkError> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| LinkError::Join("wifi ssid too long".to_string()))?,
                password: password
                    .try_into()
                    .map_err(|_| LinkError::Join("wifi password too long".to_string()))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(|err| LinkError::Driver(format!("{err:?}")))?;

        let started = self
            .wifi
            .is_started()
            .map_err(|err| LinkError::Driver(format!("{err:?}")))?;
        if !started {
            self.wifi
                .start()
                .map_err(|err| LinkError::Driver(format!("{err:?}")))?;
        }

        self.ssid = ssid.to_string();
        self.wifi
            .connect()
            .map_err(|err| LinkError::Join(format!("{err:?}")))
    }

    fn is_up(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.sta_netif().is_up().unwrap_or(false)
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            warn!("wifi disconnect failed: {err:?}");
        }
    }

    fn info(&self) -> LinkInfo {
        let netif = self.wifi.sta_netif();
        let mac_address = netif
            .get_mac()
            .map(|mac| {
                mac.iter()
                    .map(|b| format!("{b:02X}"))
                    .collect::<Vec<_>>()
                    .join(":")
            })
            .unwrap_or_default();
        let ip_address = netif
            .get_ip_info()
            .map(|ip| ip.ip.to_string())
            .unwrap_or_default();

        LinkInfo {
            mac_address,
            ip_address,
            ssid: self.ssid.clone(),
            rssi: station_rssi(),
        }
    }
}

fn station_rssi() -> i32 {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    if rc == esp_idf_svc::sys::ESP_OK {
        i32::from(ap_info.rssi)
    } else {
        0
    }
}

struct EspMqttSession {
    client: Option<EspMqttClient<'static>>,
    health: Arc<SessionHealth>,
    inbox: Option<Receiver<InboundMessage>>,
}

impl Default for EspMqttSession {
    fn default() -> Self {
        Self {
            client: None,
            health: Arc::default(),
            inbox: None,
        }
    }
}

impl MqttSession for EspMqttSession {
    fn connect(&mut self, options: &BrokerOptions) -> Result<(), SessionError> {
        // Dropping the old client ends its receiver thread.
        self.client = None;
        self.inbox = None;

        let url = format!("mqtt://{}:{}", options.host, options.port);
        let conf = MqttClientConfiguration {
            client_id: Some(options.client_id.as_str()),
            username: options.credentials.as_ref().map(|(user, _)| user.as_str()),
            password: options.credentials.as_ref().map(|(_, pass)| pass.as_str()),
            ..Default::default()
        };

        let (client, conn) = EspMqttClient::new(url.as_str(), &conf)
            .map_err(|err| SessionError::Transport(format!("{err:?}")))?;

        let health = Arc::new(SessionHealth::default());
        let (tx, rx) = mpsc::channel();
        spawn_mqtt_receiver(conn, health.clone(), tx)
            .map_err(|err| SessionError::Transport(format!("{err:#}")))?;

        let deadline = Instant::now() + MQTT_CONNECT_TIMEOUT;
        while !health.is_healthy() {
            if Instant::now() >= deadline {
                return Err(SessionError::Timeout);
            }
            thread::sleep(MQTT_CONNECT_POLL);
        }

        self.client = Some(client);
        self.health = health;
        self.inbox = Some(rx);
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        // esp-mqtt reconnects by itself; a latched drop still forces a new
        // handshake so the command topic gets resubscribed.
        self.client.is_some() && self.health.is_healthy()
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        let client = self.client.as_mut().ok_or(SessionError::NotConnected)?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| SessionError::Transport(format!("{err:?}")))
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        let client = self.client.as_mut().ok_or(SessionError::NotConnected)?;
        client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(|err| SessionError::Transport(format!("{err:?}")))
    }

    fn poll(&mut self) -> Option<InboundMessage> {
        self.inbox.as_ref()?.try_recv().ok()
    }

    fn flush(&mut self, window_ms: u64) {
        // The esp-mqtt task sends on its own; just give it time.
        thread::sleep(Duration::from_millis(window_ms));
    }
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    health: Arc<SessionHealth>,
    inbox: Sender<InboundMessage>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            while let Ok(event) = conn.next() {
                match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        health.mark_up();
                    }
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        health.mark_down();
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => {
                        let message = InboundMessage {
                            topic: topic.to_string(),
                            payload: data.to_vec(),
                        };
                        if inbox.send(message).is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            health.mark_down();
            info!("mqtt receiver stopped");
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

struct NvsStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsStore {
    fn open(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NAMESPACE, true)
            .with_context(|| format!("failed to open NVS namespace `{NAMESPACE}`"))?;
        Ok(Self { nvs })
    }
}

fn nvs_error(err: impl core::fmt::Debug) -> StoreError {
    StoreError::Backend(format!("{err:?}"))
}

impl ConfigStore for NvsStore {
    fn get_str(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        let mut buffer = [0_u8; NVS_STR_BUF_BYTES];
        Ok(self
            .nvs
            .get_str(key, &mut buffer)
            .map_err(nvs_error)?
            .map(str::to_string))
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.nvs.set_str(key, value).map_err(nvs_error)
    }

    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StoreError> {
        self.nvs.get_i32(key).map_err(nvs_error)
    }

    fn put_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError> {
        self.nvs.set_i32(key, value).map_err(nvs_error)
    }
}

struct EspFirmwareSource;

struct EspDownload {
    conn: EspHttpConnection,
}

impl FirmwareSource for EspFirmwareSource {
    fn get(&mut self, url: &str) -> Result<Box<dyn FirmwareDownload>, FetchError> {
        let transport = |err: esp_idf_svc::sys::EspError| FetchError::Transport(format!("{err:?}"));

        let mut conn = EspHttpConnection::new(&HttpClientConfiguration {
            timeout: Some(HTTP_TIMEOUT),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        })
        .map_err(transport)?;
        conn.initiate_request(Method::Get, url, &[])
            .map_err(transport)?;
        conn.initiate_response().map_err(transport)?;

        Ok(Box::new(EspDownload { conn }))
    }
}

impl FirmwareDownload for EspDownload {
    fn status(&self) -> i32 {
        i32::from(self.conn.status())
    }

    fn content_length(&self) -> Option<u64> {
        self.conn
            .header("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FetchError> {
        self.conn
            .read(buf)
            .map_err(|err| FetchError::Read(format!("{err:?}")))
    }
}

struct EspFlash {
    ota: EspOta,
}

impl EspFlash {
    fn new() -> anyhow::Result<Self> {
        let ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
        Ok(Self { ota })
    }
}

fn next_update_partition_size() -> Option<u64> {
    let partition = unsafe { esp_idf_svc::sys::esp_ota_get_next_update_partition(core::ptr::null()) };
    if partition.is_null() {
        return None;
    }
    Some(u64::from(unsafe { (*partition).size }))
}

struct EspFlashUpdate<'a> {
    update: EspOtaUpdate<'a>,
    written: u64,
}

impl FlashTarget for EspFlash {
    fn begin(&mut self, size: Option<u64>) -> Result<Box<dyn FlashUpdate + '_>, FlashError> {
        let available = next_update_partition_size()
            .ok_or_else(|| FlashError::Begin("no OTA partition available".to_string()))?;
        if let Some(requested) = size.filter(|requested| *requested > available) {
            return Err(FlashError::InsufficientSpace {
                requested,
                available,
            });
        }

        let update = self
            .ota
            .initiate_update()
            .map_err(|err| FlashError::Begin(format!("{err:?}")))?;
        info!("ota partition opened ({available} bytes available)");
        Ok(Box::new(EspFlashUpdate { update, written: 0 }))
    }
}

impl FlashUpdate for EspFlashUpdate<'_> {
    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError> {
        self.update
            .write(data)
            .map_err(|err| FlashError::Write(format!("{err:?}")))?;
        self.written += data.len() as u64;
        Ok(data.len())
    }

    fn finalize(self: Box<Self>) -> Result<bool, FlashError> {
        let EspFlashUpdate { update, written } = *self;
        if written == 0 {
            let _ = update.abort();
            return Ok(false);
        }
        update
            .complete()
            .map_err(|err| FlashError::Finalize(format!("{err:?}")))?;
        Ok(true)
    }

    fn abort(self: Box<Self>) {
        if let Err(err) = self.update.abort() {
            warn!("failed to abort OTA update: {err:?}");
        }
    }
}

struct EspSystem;

impl System for EspSystem {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn restart(&mut self) {
        unsafe { esp_idf_svc::sys::esp_restart() };
    }

    fn free_heap(&self) -> u32 {
        unsafe { esp_idf_svc::sys::esp_get_free_heap_size() }
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
