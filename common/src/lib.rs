pub mod board;
pub mod color;
pub mod config;
pub mod connectivity;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod lights;
pub mod ota;
pub mod store;
pub mod telemetry;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use board::{
    Board, BrokerOptions, FirmwareDownload, FirmwareSource, FlashTarget, FlashUpdate,
    InboundMessage, LinkInfo, MqttSession, PixelStrip, SessionHealth, System, WifiLink,
};
pub use color::Rgb;
pub use config::{DeviceConfig, NetworkConfig, RuntimeConfig, TimingConfig};
pub use device::{Device, Tick};
pub use store::{ConfigStore, MemoryStore};
pub use topics::*;
pub use types::{Command, ResponsePayload, ResponseStatus, StatusPayload};
