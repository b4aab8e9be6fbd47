use std::collections::HashMap;

use crate::error::StoreError;

pub const NAMESPACE: &str = "medication";

pub const KEY_WIFI_SSID: &str = "wifi_ssid";
pub const KEY_WIFI_PASS: &str = "wifi_pass";
pub const KEY_MQTT_SERVER: &str = "mqtt_server";
pub const KEY_MQTT_PORT: &str = "mqtt_port";

/// Durable key/value persistence that survives a restart.
pub trait ConfigStore {
    fn get_str(&mut self, key: &str) -> Result<Option<String>, StoreError>;
    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StoreError>;
    fn put_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    Str(String),
    Int(i32),
}

/// Volatile store, used by tests and as a fallback when no backend is available.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: HashMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &HashMap<String, StoredValue> {
        &self.entries
    }
}

impl ConfigStore for MemoryStore {
    fn get_str(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entries.get(key) {
            Some(StoredValue::Str(value)) => Ok(Some(value.clone())),
            Some(StoredValue::Int(_)) => Err(StoreError::Backend(format!(
                "key `{key}` holds an integer"
            ))),
            None => Ok(None),
        }
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), StoredValue::Str(value.to_string()));
        Ok(())
    }

    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StoreError> {
        match self.entries.get(key) {
            Some(StoredValue::Int(value)) => Ok(Some(*value)),
            Some(StoredValue::Str(_)) => Err(StoreError::Backend(format!(
                "key `{key}` holds a string"
            ))),
            None => Ok(None),
        }
    }

    fn put_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), StoredValue::Int(value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_keeps_types_apart() {
        let mut store = MemoryStore::new();
        store.put_str(KEY_WIFI_SSID, "clinic").unwrap();
        store.put_i32(KEY_MQTT_PORT, 8883).unwrap();

        assert_eq!(store.get_str(KEY_WIFI_SSID).unwrap().as_deref(), Some("clinic"));
        assert_eq!(store.get_i32(KEY_MQTT_PORT).unwrap(), Some(8883));
        assert!(store.get_i32(KEY_WIFI_SSID).is_err());
        assert_eq!(store.get_str(KEY_WIFI_PASS).unwrap(), None);
    }
}
