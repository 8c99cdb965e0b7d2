//! Data model shared by every component
//!
//! Endpoints, sensor descriptors and the records produced for the sinks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;

/// Immutable broker address plus credentials
///
/// Two endpoints are equal iff every field is equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl BrokerEndpoint {
    /// Build an endpoint, stripping any `tcp://` or `udp://` scheme from the host
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .trim()
            .trim_start_matches("tcp://")
            .trim_start_matches("udp://")
            .to_string();
        Self {
            host: if host.is_empty() { "localhost".into() } else { host },
            port,
            username: String::new(),
            password: String::new(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// `host:port`, the connection URI the transport dials
    pub fn uri(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

fn default_min_value() -> i64 {
    10
}

fn default_max_value() -> i64 {
    30
}

fn default_delta() -> i64 {
    1
}

/// Static description of a virtual sensor, as read from `sensors.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Milliseconds between two samples
    #[serde(default)]
    pub collection_time: i64,
    /// Milliseconds of samples accumulated before a publish
    #[serde(default)]
    pub publishing_time: i64,
    #[serde(default = "default_min_value")]
    pub min_value: i64,
    #[serde(default = "default_max_value")]
    pub max_value: i64,
    #[serde(default = "default_delta")]
    pub delta: i64,
}

impl SensorSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_value > self.max_value {
            return Err(ConfigError::SensorBounds {
                id: self.id.clone(),
                kind: self.kind.clone(),
                min: self.min_value,
                max: self.max_value,
            });
        }
        Ok(())
    }

    /// Whether a (collect, publish) cadence pair can drive a flow
    pub fn valid_cadence(collect: i64, publish: i64) -> bool {
        collect >= 1 && publish >= 1
    }
}

/// Lifecycle of a sensor flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    Idle,
    Running,
    Paused,
}

/// Opaque experiment labels attached to every latency record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentMeta {
    pub number: i32,
    pub kind: i32,
    pub level: i32,
}

/// One publish window worth of samples from a sensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorReading {
    pub timestamp_ms: i64,
    pub device_id: String,
    pub sensor_id: String,
    pub values: Vec<i64>,
}

/// Round-trip measurement of one acknowledged publish
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyRecord {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(rename = "sensorId")]
    pub sensor_id: String,
    #[serde(rename = "brokerIp")]
    pub broker_ip: String,
    pub experiment: i32,
    #[serde(rename = "type")]
    pub kind: i32,
    pub level: i32,
    /// Nanoseconds between publish and delivery acknowledgement
    #[serde(serialize_with = "serialize_nanos")]
    pub latency: Duration,
    pub message: String,
}

fn serialize_nanos<S: serde::Serializer>(latency: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX))
}
