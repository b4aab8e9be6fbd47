use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    error::StoreError,
    store::{ConfigStore, KEY_MQTT_PORT, KEY_MQTT_SERVER, KEY_WIFI_PASS, KEY_WIFI_SSID},
    topics::DEFAULT_BASE_TOPIC,
};

pub const MAX_SSID_BYTES: usize = 31;
pub const MAX_PASSPHRASE_BYTES: usize = 63;
pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    pub device_id: String,
    pub base_topic: String,
    pub client_id_prefix: String,
    pub firmware_version: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "ESP32_001".to_string(),
            base_topic: DEFAULT_BASE_TOPIC.to_string(),
            client_id_prefix: "ESP32".to_string(),
            firmware_version: "1.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub link_poll_interval_ms: u64,
    pub link_poll_attempts: u32,
    pub link_rejoin_settle_ms: u64,
    pub broker_retry_delay_ms: u64,
    pub status_interval_ms: u64,
    pub restart_flush_ms: u64,
    pub loop_idle_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            link_poll_interval_ms: 500,
            link_poll_attempts: 20,
            link_rejoin_settle_ms: 1_000,
            broker_retry_delay_ms: 5_000,
            status_interval_ms: 30_000,
            restart_flush_ms: 1_000,
            loop_idle_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub device: DeviceConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.device.sanitize();
        self.network.sanitize();
        self.timing.sanitize();
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.device_id.trim().is_empty() {
            self.device_id = defaults.device_id;
        }
        if self.base_topic.trim().is_empty() {
            self.base_topic = defaults.base_topic;
        }
        if self.client_id_prefix.trim().is_empty() {
            self.client_id_prefix = defaults.client_id_prefix;
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        truncate_utf8(&mut self.wifi_ssid, MAX_SSID_BYTES);
        truncate_utf8(&mut self.wifi_pass, MAX_PASSPHRASE_BYTES);
        if self.mqtt_port == 0 {
            self.mqtt_port = DEFAULT_MQTT_PORT;
        }
    }

    /// Overlays persisted credentials on top of `defaults`.
    pub fn load(store: &mut dyn ConfigStore, defaults: NetworkConfig) -> Result<Self, StoreError> {
        let mut network = defaults;

        if let Some(ssid) = store.get_str(KEY_WIFI_SSID)? {
            network.wifi_ssid = ssid;
        }
        if let Some(pass) = store.get_str(KEY_WIFI_PASS)? {
            network.wifi_pass = pass;
        }
        if let Some(host) = store.get_str(KEY_MQTT_SERVER)? {
            network.mqtt_host = host;
        }
        if let Some(port) = store.get_i32(KEY_MQTT_PORT)? {
            match u16::try_from(port) {
                Ok(port) if port > 0 => network.mqtt_port = port,
                _ => warn!("ignoring stored mqtt_port {port}; keeping {}", network.mqtt_port),
            }
        }

        network.sanitize();
        Ok(network)
    }

    pub fn save(&self, store: &mut dyn ConfigStore) -> Result<(), StoreError> {
        store.put_str(KEY_WIFI_SSID, &self.wifi_ssid)?;
        store.put_str(KEY_WIFI_PASS, &self.wifi_pass)?;
        store.put_str(KEY_MQTT_SERVER, &self.mqtt_host)?;
        store.put_i32(KEY_MQTT_PORT, i32::from(self.mqtt_port))?;
        Ok(())
    }

    /// Saves `self` over `previous`. If any key fails to write, `previous` is
    /// written back so the store never mixes the two credential sets.
    pub fn save_replacing(
        &self,
        previous: &NetworkConfig,
        store: &mut dyn ConfigStore,
    ) -> Result<(), StoreError> {
        let Err(err) = self.save(store) else {
            return Ok(());
        };

        let restored = [
            (KEY_WIFI_SSID, store.put_str(KEY_WIFI_SSID, &previous.wifi_ssid)),
            (KEY_WIFI_PASS, store.put_str(KEY_WIFI_PASS, &previous.wifi_pass)),
            (KEY_MQTT_SERVER, store.put_str(KEY_MQTT_SERVER, &previous.mqtt_host)),
            (KEY_MQTT_PORT, store.put_i32(KEY_MQTT_PORT, i32::from(previous.mqtt_port))),
        ];
        for (key, result) in restored {
            if let Err(restore_err) = result {
                warn!("could not restore {key} after failed save: {restore_err}");
            }
        }
        Err(err)
    }
}

impl TimingConfig {
    pub fn sanitize(&mut self) {
        if self.link_poll_attempts == 0 {
            self.link_poll_attempts = 1;
        }
        if self.status_interval_ms == 0 {
            self.status_interval_ms = Self::default().status_interval_ms;
        }
    }
}

/// Cuts `value` to at most `max_bytes` without splitting a UTF-8 sequence.
pub fn truncate_utf8(value: &mut String, max_bytes: usize) {
    if value.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    value.truncate(cut);
}
