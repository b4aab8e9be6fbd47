use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

pub const MAX_COMMAND_PAYLOAD_BYTES: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusPayload {
    pub device_id: String,
    pub mac_address: String,
    pub ip_address: String,
    pub wifi_ssid: String,
    pub rssi: i32,
    pub firmware_version: String,
    pub uptime: u64,
    pub free_heap: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Starting,
    Success,
    Failed,
    Rebooting,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponsePayload {
    pub status: ResponseStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compartment: Option<u8>,
}

impl ResponsePayload {
    pub fn new(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            compartment: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ResponseStatus::Failed, message)
    }

    pub fn with_compartment(mut self, compartment: u8) -> Self {
        self.compartment = Some(compartment);
        self
    }
}

#[derive(Debug, Deserialize)]
struct CommandEnvelope {
    command: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Reboot,
    OtaUpdate {
        url: String,
        version: String,
        sha256: Option<String>,
    },
    WifiChange {
        ssid: String,
        password: String,
    },
    LedControl {
        compartment: i64,
        color: String,
        brightness: u8,
    },
    GetStatus,
    Unknown(String),
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Self::Reboot => "reboot",
            Self::OtaUpdate { .. } => "ota_update",
            Self::WifiChange { .. } => "wifi_change",
            Self::LedControl { .. } => "led_control",
            Self::GetStatus => "get_status",
            Self::Unknown(name) => name,
        }
    }

    /// Decodes a command-channel message. Missing or mistyped parameters fall
    /// back to empty strings and zero, leaving validation to the handlers.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.len() > MAX_COMMAND_PAYLOAD_BYTES {
            return Err(DecodeError::TooLarge(raw.len()));
        }

        let envelope: CommandEnvelope = serde_json::from_slice(raw)?;
        let params = &envelope.payload;

        let command = match envelope.command.as_str() {
            "reboot" => Self::Reboot,
            "ota_update" => Self::OtaUpdate {
                url: param_str(params, "url"),
                version: param_str(params, "version"),
                sha256: Some(param_str(params, "sha256")).filter(|sha| !sha.is_empty()),
            },
            "wifi_change" => Self::WifiChange {
                ssid: param_str(params, "ssid"),
                password: param_str(params, "password"),
            },
            "led_control" => Self::LedControl {
                compartment: param_i64(params, "compartment"),
                color: param_str(params, "color"),
                brightness: param_i64(params, "brightness").clamp(0, 100) as u8,
            },
            "get_status" => Self::GetStatus,
            _ => Self::Unknown(envelope.command),
        };

        Ok(command)
    }
}

fn param_str(params: &Value, key: &str) -> String {
    params
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn param_i64(params: &Value, key: &str) -> i64 {
    match params.get(key) {
        Some(value) => value
            .as_i64()
            .or_else(|| value.as_f64().map(|v| v as i64))
            .unwrap_or(0),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn decodes_led_control() {
        let raw = br##"{"command":"led_control","payload":{"compartment":2,"color":"#00FF00","brightness":50}}"##;

        assert_eq!(
            Command::decode(raw).unwrap(),
            Command::LedControl {
                compartment: 2,
                color: "#00FF00".to_string(),
                brightness: 50,
            }
        );
    }

    #[test]
    fn missing_payload_is_allowed() {
        assert_eq!(
            Command::decode(br#"{"command":"get_status"}"#).unwrap(),
            Command::GetStatus
        );
        assert_eq!(
            Command::decode(br#"{"command":"reboot","payload":{},"timestamp":"2026-01-01T00:00:00"}"#)
                .unwrap(),
            Command::Reboot
        );
    }

    #[test]
    fn missing_fields_become_empty() {
        assert_eq!(
            Command::decode(br#"{"command":"ota_update","payload":{"version":"1.1.0"}}"#).unwrap(),
            Command::OtaUpdate {
                url: String::new(),
                version: "1.1.0".to_string(),
                sha256: None,
            }
        );
        assert_eq!(
            Command::decode(br#"{"command":"wifi_change"}"#).unwrap(),
            Command::WifiChange {
                ssid: String::new(),
                password: String::new(),
            }
        );
    }

    #[test]
    fn numeric_params_are_lenient() {
        let raw = br#"{"command":"led_control","payload":{"compartment":"3","color":7,"brightness":250.9}}"#;

        assert_eq!(
            Command::decode(raw).unwrap(),
            Command::LedControl {
                compartment: 0,
                color: String::new(),
                brightness: 100,
            }
        );
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(Command::decode(b"not json").is_err());
        assert!(Command::decode(br#"{"payload":{}}"#).is_err());
        assert!(Command::decode(br#"["reboot"]"#).is_err());

        let oversized = format!(
            r#"{{"command":"reboot","payload":{{"pad":"{}"}}}}"#,
            "x".repeat(MAX_COMMAND_PAYLOAD_BYTES)
        );
        assert!(matches!(
            Command::decode(oversized.as_bytes()),
            Err(DecodeError::TooLarge(_))
        ));
    }

    #[test]
    fn unknown_commands_keep_their_name() {
        let command = Command::decode(br#"{"command":"dispense","payload":{}}"#).unwrap();
        assert_eq!(command, Command::Unknown("dispense".to_string()));
        assert_eq!(command.name(), "dispense");
    }

    #[test]
    fn response_omits_absent_compartment() {
        let body = serde_json::to_value(ResponsePayload::failed("Not enough space")).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"status": "failed", "message": "Not enough space"})
        );

        let body = serde_json::to_value(
            ResponsePayload::new(ResponseStatus::Success, "LED updated").with_compartment(2),
        )
        .unwrap();
        assert_eq!(body["compartment"], 2);
    }
}
