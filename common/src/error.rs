use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("wifi association failed: {0}")]
    Join(String),
    #[error("wifi driver error: {0}")]
    Driver(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("broker refused connection (rc={0})")]
    Refused(i32),
    #[error("broker connection timed out")]
    Timeout,
    #[error("mqtt session is not connected")]
    NotConnected,
    #[error("mqtt transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("config store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("http transport error: {0}")]
    Transport(String),
    #[error("http body read failed: {0}")]
    Read(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("not enough space for {requested} bytes ({available} available)")]
    InsufficientSpace { requested: u64, available: u64 },
    #[error("failed to open update partition: {0}")]
    Begin(String),
    #[error("flash write failed: {0}")]
    Write(String),
    #[error("image finalization failed: {0}")]
    Finalize(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LightError {
    #[error("compartment index {0} is out of range")]
    InvalidCompartment(i64),
    #[error("led strip error: {0}")]
    Strip(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload too large ({0} bytes)")]
    TooLarge(usize),
    #[error("invalid command json: {0}")]
    Json(#[from] serde_json::Error),
}
