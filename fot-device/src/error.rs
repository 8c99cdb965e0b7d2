//! Error taxonomy for the device runtime
//!
//! Failures stay local to the component that raised them:
//! - `TransportError` comes from the pub/sub collaborator
//! - `SinkError` ends one buffer consumer, never the producers
//! - `CodecError` marks an inbound payload as malformed (logged, ignored)
//! - `DeviceError` is what core operations surface to their callers

use std::time::Duration;

/// Failures reported by a transport implementation
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {uri} failed: {reason}")]
    Connect { uri: String, reason: String },
    #[error("connect to {uri} timed out after {timeout:?}")]
    ConnectTimeout { uri: String, timeout: Duration },
    #[error("publish on {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("disconnect failed: {0}")]
    Disconnect(String),
    #[error("connection closed")]
    Closed,
}

/// Failures of a batch sink
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API answered {status}: {body}")]
    Status { status: u16, body: String },
}

/// Inbound payloads the codec could not make sense of
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid JSON content: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("message has no JSON content")]
    NoContent,
}

/// Configuration problems detected at startup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid sensors file: {0}")]
    Sensors(#[from] serde_json::Error),
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("sensor {id} ({kind}) has min value {min} greater than max value {max}")]
    SensorBounds {
        id: String,
        kind: String,
        min: i64,
        max: i64,
    },
    #[error("duplicate sensor id: {0}")]
    DuplicateSensor(String),
}

/// Errors surfaced by the device core operations
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("connection error: {0}")]
    Connection(#[source] TransportError),
    #[error("publish error: {0}")]
    Publish(#[source] TransportError),
    #[error("device is not connected to any broker")]
    NotConnected,
    #[error("no CONNACK received within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("broker {0} rejected the connection")]
    HandshakeRejected(String),
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] CodecError),
    #[error("sink error: {0}")]
    SinkIo(#[from] SinkError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T, E = DeviceError> = std::result::Result<T, E>;
