//! Device configuration
//!
//! Layered like this, last one wins:
//! - built-in defaults
//! - the YAML file named by `FOT_DEVICE_CONFIG` (default `device.yaml`)
//! - environment variables (`.env` included, loaded by the binary)
//!
//! Sensors come from a separate JSON file (`sensors.json` by default).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::models::{BrokerEndpoint, ExperimentMeta, SensorSpec};

pub const CONFIG_PATH_VAR: &str = "FOT_DEVICE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "device.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConf {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for BrokerConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            username: "karaf".into(),
            password: "karaf".into(),
        }
    }
}

/// Experiment labels and where the measurements go
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub number: i32,
    #[serde(rename = "type")]
    pub kind: i32,
    pub level: i32,
    pub buffer_size: usize,
    pub api_url: String,
    /// Also write latencies to `{device}_{exp}_ll.csv`
    pub log_latency: bool,
    /// Write telemetry to `{device}_ml.csv`
    pub persist_messages: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            number: 0,
            kind: 0,
            level: 0,
            buffer_size: 64,
            api_url: "http://localhost:8080/api/latency-records/records".into(),
            log_latency: false,
            persist_messages: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_id: String,
    pub broker: BrokerConf,
    pub experiment: ExperimentConfig,
    pub connect_timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub sensors_file: String,
    pub output_dir: String,
    /// Open the first connection through the CONNECT/CONNACK handshake
    pub handshake_on_start: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            broker: BrokerConf::default(),
            experiment: ExperimentConfig::default(),
            connect_timeout_ms: 10_000,
            retry_interval_ms: 1_000,
            sensors_file: "sensors.json".into(),
            output_dir: "exp".into(),
            handshake_on_start: true,
        }
    }
}

impl DeviceConfig {
    /// Empty content yields the defaults
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Override fields from variables returned by `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DEVICE_ID") {
            self.device_id = v;
        }
        if let Some(v) = get("BROKER_IP") {
            self.broker.host = v;
        }
        if let Some(v) = get("PORT") {
            self.broker.port = parse_var("PORT", &v)?;
        }
        if let Some(v) = get("USERNAME") {
            self.broker.username = v;
        }
        if let Some(v) = get("PASSWORD") {
            self.broker.password = v;
        }
        if let Some(v) = get("EXP_NUM") {
            self.experiment.number = parse_var("EXP_NUM", &v)?;
        }
        if let Some(v) = get("EXP_TYPE") {
            self.experiment.kind = parse_var("EXP_TYPE", &v)?;
        }
        if let Some(v) = get("EXP_LEVEL") {
            self.experiment.level = parse_var("EXP_LEVEL", &v)?;
        }
        if let Some(v) = get("BUFFER_SIZE") {
            self.experiment.buffer_size = parse_var("BUFFER_SIZE", &v)?;
        }
        if let Some(v) = get("API_URL") {
            self.experiment.api_url = v;
        }
        if let Some(v) = get("CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = parse_var("CONNECT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("SENSORS_FILE") {
            self.sensors_file = v;
        }
        if let Some(v) = get("PERSIST_MESSAGES") {
            self.experiment.persist_messages = parse_flag("PERSIST_MESSAGES", &v)?;
        }
        if let Some(v) = get("LOG_LATENCY") {
            self.experiment.log_latency = parse_flag("LOG_LATENCY", &v)?;
        }
        Ok(())
    }

    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint::new(self.broker.host.clone(), self.broker.port)
            .with_credentials(self.broker.username.clone(), self.broker.password.clone())
    }

    pub fn experiment_meta(&self) -> ExperimentMeta {
        ExperimentMeta {
            number: self.experiment.number,
            kind: self.experiment.kind,
            level: self.experiment.level,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn telemetry_file_name(&self) -> String {
        format!("{}_ml.csv", self.device_id)
    }

    pub fn latency_file_name(&self) -> String {
        format!("{}_{}_ll.csv", self.device_id, self.experiment.number)
    }
}

fn parse_var<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
        }),
    }
}

/// Load the YAML file then apply the process environment
pub async fn load_config() -> Result<DeviceConfig, ConfigError> {
    let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = if Path::new(&path).exists() {
        let content = fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        info!("Loaded configuration from {}", path);
        DeviceConfig::from_yaml_str(&content)?
    } else {
        info!("No {} found, using default configuration", path);
        DeviceConfig::default()
    };

    config.apply_env(|var| std::env::var(var).ok())?;
    Ok(config)
}

/// Parse and validate a JSON array of sensors
pub fn parse_sensors(content: &str) -> Result<Vec<SensorSpec>, ConfigError> {
    let sensors: Vec<SensorSpec> = serde_json::from_str(content)?;
    let mut seen = HashSet::new();
    for sensor in &sensors {
        sensor.validate()?;
        if !seen.insert(sensor.id.as_str()) {
            return Err(ConfigError::DuplicateSensor(sensor.id.clone()));
        }
    }
    if sensors.is_empty() {
        warn!("sensors file declares no sensor");
    }
    Ok(sensors)
}

pub async fn load_sensors(path: impl AsRef<Path>) -> Result<Vec<SensorSpec>, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_sensors(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_yaml_gives_defaults() {
        let config = DeviceConfig::from_yaml_str("  \n").unwrap();
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.experiment.buffer_size, 64);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert!(uuid::Uuid::parse_str(&config.device_id).is_ok());
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let yaml = "device_id: dev7\nbroker:\n  host: 10.0.0.3\nexperiment:\n  number: 4\n  type: 2\n";
        let config = DeviceConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.device_id, "dev7");
        assert_eq!(config.broker.host, "10.0.0.3");
        assert_eq!(config.broker.username, "karaf");
        assert_eq!(config.experiment.kind, 2);
        assert_eq!(config.latency_file_name(), "dev7_4_ll.csv");
        assert_eq!(config.telemetry_file_name(), "dev7_ml.csv");
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("DEVICE_ID", "sim-1"),
            ("BROKER_IP", "tcp://broker.local"),
            ("PORT", "1884"),
            ("EXP_LEVEL", "3"),
            ("PERSIST_MESSAGES", "true"),
            ("API_URL", ""),
        ]
        .into_iter()
        .collect();

        let mut config = DeviceConfig::default();
        config
            .apply_env(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.device_id, "sim-1");
        assert_eq!(config.endpoint(), BrokerEndpoint::new("broker.local", 1884).with_credentials("karaf", "karaf"));
        assert_eq!(config.experiment_meta().level, 3);
        assert!(config.experiment.persist_messages);
        assert_eq!(config.experiment.api_url, ExperimentConfig::default().api_url);
    }

    #[test]
    fn bad_env_value_is_reported() {
        let mut config = DeviceConfig::default();
        let err = config
            .apply_env(|var| (var == "PORT").then(|| "not-a-port".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "PORT", .. }));
    }

    #[test]
    fn sensors_are_validated() {
        let ok = r#"[{"id":"t1","type":"temperature","collection_time":100,"publishing_time":500},
                     {"id":"h1","type":"humidity","collection_time":200,"publishing_time":1000,"min_value":40,"max_value":60,"delta":2}]"#;
        let sensors = parse_sensors(ok).unwrap();
        assert_eq!(sensors.len(), 2);
        assert_eq!(sensors[1].delta, 2);

        let bounds = r#"[{"id":"t1","type":"temperature","min_value":50,"max_value":10}]"#;
        assert!(matches!(parse_sensors(bounds), Err(ConfigError::SensorBounds { .. })));

        let dup = r#"[{"id":"t1","type":"a"},{"id":"t1","type":"b"}]"#;
        assert!(matches!(parse_sensors(dup), Err(ConfigError::DuplicateSensor(_))));
    }

    #[tokio::test]
    async fn missing_sensors_file_is_an_io_error() {
        let err = load_sensors("/definitely/not/here.json").await.unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
