pub const DEFAULT_BASE_TOPIC: &str = "medication/devices";

pub const SUFFIX_STATUS: &str = "status";
pub const SUFFIX_COMMAND: &str = "command";
pub const SUFFIX_RESPONSE: &str = "response";

/// Channel names for one device: `<base>/<device_id>/<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub status: String,
    pub command: String,
    pub response: String,
}

impl Topics {
    pub fn for_device(base_topic: &str, device_id: &str) -> Self {
        let base = base_topic.trim_end_matches('/');
        Self {
            status: format!("{base}/{device_id}/{SUFFIX_STATUS}"),
            command: format!("{base}/{device_id}/{SUFFIX_COMMAND}"),
            response: format!("{base}/{device_id}/{SUFFIX_RESPONSE}"),
        }
    }
}

pub fn client_id(prefix: &str, device_id: &str) -> String {
    format!("{prefix}_{device_id}")
}
