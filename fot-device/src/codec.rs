//! TATU message codec
//!
//! Requests are plain text (`METHOD KIND TARGET [json]`), responses are JSON
//! objects carrying `"CODE":"POST"` and an object `BODY`. Only the subset the
//! device speaks is covered here.

use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Duration;

use crate::error::CodecError;
use crate::models::{BrokerEndpoint, SensorSpec};

pub const TOPIC_BASE: &str = "dev/";
pub const RESPONSE_SUFFIX: &str = "/RES";
pub const CONNECTIONS_TOPIC: &str = "dev/CONNECTIONS";
pub const CONNECTIONS_RESPONSE_TOPIC: &str = "dev/CONNECTIONS/RES";

/// Shortest payload that can still be a meaningful TATU message
const MIN_MESSAGE_LEN: usize = 11;

/// Topic a device listens on for commands
pub fn command_topic(device_id: &str) -> String {
    format!("{TOPIC_BASE}{device_id}")
}

/// Topic a device answers GET/FLOW requests on
pub fn response_topic(device_id: &str) -> String {
    format!("{TOPIC_BASE}{device_id}{RESPONSE_SUFFIX}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Connect,
    Connack,
    Evt,
    Flow,
    Get,
    Set,
    Post,
    Invalid,
}

impl Method {
    pub fn parse(word: &str) -> Self {
        match word {
            "CONNECT" => Method::Connect,
            "CONNACK" => Method::Connack,
            "EVT" => Method::Evt,
            "FLOW" => Method::Flow,
            "GET" => Method::Get,
            "SET" => Method::Set,
            "POST" => Method::Post,
            _ => Method::Invalid,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Connect => "CONNECT",
            Method::Connack => "CONNACK",
            Method::Evt => "EVT",
            Method::Flow => "FLOW",
            Method::Get => "GET",
            Method::Set => "SET",
            Method::Post => "POST",
            Method::Invalid => "INVALID",
        }
    }

    fn carries_content(&self) -> bool {
        matches!(self, Method::Flow | Method::Set | Method::Connect)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded inbound message
#[derive(Debug, Clone)]
pub struct TatuMessage {
    pub method: Method,
    /// Third word of a request (sensor id or `brokerMqtt`), first non-FLOW body key of a response
    pub target: Option<String>,
    /// JSON part of a FLOW/SET/CONNECT request
    pub content: Option<String>,
    /// Parsed JSON of a response
    pub response: Option<Value>,
    pub raw: String,
}

impl TatuMessage {
    pub fn is_response(&self) -> bool {
        self.response.is_some()
    }

    pub fn content(&self) -> Result<&str, CodecError> {
        self.content.as_deref().ok_or(CodecError::NoContent)
    }

    pub fn target(&self) -> Result<&str, CodecError> {
        self.target.as_deref().ok_or(CodecError::MissingField("target"))
    }

    /// `BODY.CAN_CONNECT` of a CONNACK response
    pub fn connack_accepted(&self) -> Result<bool, CodecError> {
        let body = self
            .response
            .as_ref()
            .and_then(|r| r.get("BODY"))
            .ok_or(CodecError::MissingField("BODY"))?;
        body.get("CAN_CONNECT")
            .and_then(Value::as_bool)
            .ok_or(CodecError::MissingField("CAN_CONNECT"))
    }

    /// `HEADER.NAME` of a response
    pub fn response_name(&self) -> Option<&str> {
        self.response
            .as_ref()
            .and_then(|r| r.get("HEADER"))
            .and_then(|h| h.get("NAME"))
            .and_then(Value::as_str)
    }
}

/// Decode a raw payload. Short or unknown messages decode to `Method::Invalid`.
pub fn decode(payload: &[u8]) -> Result<TatuMessage, CodecError> {
    let raw = String::from_utf8(payload.to_vec())?;

    if raw.chars().count() < MIN_MESSAGE_LEN {
        return Ok(TatuMessage {
            method: Method::Invalid,
            target: None,
            content: None,
            response: None,
            raw,
        });
    }

    if let Some(response) = as_response(&raw) {
        let method = response
            .get("METHOD")
            .and_then(Value::as_str)
            .map(Method::parse)
            .unwrap_or(Method::Invalid);
        let target = response
            .get("BODY")
            .and_then(Value::as_object)
            .and_then(|body| body.keys().find(|k| k.as_str() != "FLOW").cloned());
        return Ok(TatuMessage {
            method,
            target,
            content: None,
            response: Some(response),
            raw,
        });
    }

    let mut words = raw.split(' ');
    let method = Method::parse(words.next().unwrap_or_default());
    let target = words.nth(1).map(str::to_string);
    let content = if method.carries_content() {
        let stripped = raw.replace('\\', "");
        stripped.find('{').map(|idx| stripped[idx..].to_string())
    } else {
        None
    };

    Ok(TatuMessage {
        method,
        target,
        content,
        response: None,
        raw,
    })
}

fn as_response(raw: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let is_post = value.get("CODE").and_then(Value::as_str) == Some("POST");
    let has_body = value.get("BODY").map(Value::is_object).unwrap_or(false);
    (is_post && has_body).then_some(value)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn header(device_id: &str) -> Value {
    json!({ "NAME": device_id, "TIMESTAMP": now_ms() })
}

fn sensor_descriptor(sensor: &SensorSpec) -> Value {
    json!({
        "id": sensor.id,
        "type": sensor.kind,
        "collection_time": sensor.collection_time,
        "publishing_time": sensor.publishing_time,
    })
}

/// Everything a CONNECT request announces about the device
pub struct ConnectRequest<'a> {
    pub device_id: &'a str,
    pub latitude: f64,
    pub longitude: f64,
    pub sensors: &'a [SensorSpec],
    pub source_ip: Option<&'a str>,
    pub timeout: Duration,
}

impl ConnectRequest<'_> {
    pub fn encode(&self) -> String {
        let mut head = Map::new();
        head.insert("NAME".into(), json!(self.device_id));
        head.insert("TIMESTAMP".into(), json!(now_ms()));
        if let Some(ip) = self.source_ip {
            head.insert("SOURCE_IP".into(), json!(ip));
        }
        let sensors: Vec<Value> = self.sensors.iter().map(sensor_descriptor).collect();
        let body = json!({
            "TIME_OUT": self.timeout.as_secs_f64(),
            "HEADER": Value::Object(head),
            "DEVICE": {
                "id": self.device_id,
                "latitude": self.latitude,
                "longitude": self.longitude,
                "sensors": sensors,
            },
        });
        format!("CONNECT VALUE BROKER {body}")
    }
}

pub fn flow_response(device_id: &str, sensor_id: &str, values: &[i64], collect: i64, publish: i64) -> String {
    let mut body = Map::new();
    body.insert(sensor_id.to_string(), json!(values));
    body.insert("FLOW".into(), json!({ "publish": publish, "collect": collect }));
    json!({
        "METHOD": "FLOW",
        "CODE": "POST",
        "HEADER": header(device_id),
        "BODY": Value::Object(body),
    })
    .to_string()
}

pub fn get_response(device_id: &str, sensor_id: &str, value: i64) -> String {
    let mut body = Map::new();
    body.insert(sensor_id.to_string(), json!(value));
    json!({
        "METHOD": "GET",
        "CODE": "POST",
        "HEADER": header(device_id),
        "BODY": Value::Object(body),
    })
    .to_string()
}

/// The broker side of the handshake; the device only ever parses it
pub fn connack_response(device_id: &str, new_name: &str, can_connect: bool) -> String {
    json!({
        "METHOD": "CONNACK",
        "CODE": "POST",
        "HEADER": header(device_id),
        "BODY": { "NEW_NAME": new_name, "CAN_CONNECT": can_connect },
    })
    .to_string()
}

pub fn flow_request(sensor_id: &str, collect: i64, publish: i64) -> String {
    format!(
        "FLOW VALUE {sensor_id} {}",
        json!({ "collect": collect, "publish": publish, "TIMESTAMP": now_ms() })
    )
}

/// Cadences of a FLOW request body, in milliseconds
pub fn parse_flow_body(content: &str) -> Result<(i64, i64), CodecError> {
    let value: Value = serde_json::from_str(content)?;
    Ok((int_field(&value, "collect")?, int_field(&value, "publish")?))
}

/// Candidate broker of a `SET VALUE brokerMqtt {...}` body
pub fn parse_broker_body(content: &str) -> Result<BrokerEndpoint, CodecError> {
    let value: Value = serde_json::from_str(content)?;
    let url = value
        .get("url")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingField("url"))?;
    let port = int_field(&value, "port")?;
    let port = u16::try_from(port).map_err(|_| CodecError::InvalidField {
        field: "port",
        reason: format!("{port} is not a valid port"),
    })?;
    let user = value.get("user").and_then(Value::as_str).unwrap_or_default();
    let password = value.get("password").and_then(Value::as_str).unwrap_or_default();

    Ok(BrokerEndpoint::new(url, port).with_credentials(user, password))
}

/// Integer field given either as a JSON number or a numeric string
fn int_field(value: &Value, field: &'static str) -> Result<i64, CodecError> {
    match value.get(field) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| CodecError::InvalidField {
                field,
                reason: n.to_string(),
            }),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| CodecError::InvalidField {
            field,
            reason: s.clone(),
        }),
        Some(other) => Err(CodecError::InvalidField {
            field,
            reason: other.to_string(),
        }),
        None => Err(CodecError::MissingField(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_are_invalid() {
        let msg = decode(b"GET x y").unwrap();
        assert_eq!(msg.method, Method::Invalid);
        assert!(msg.target.is_none());
    }

    #[test]
    fn get_request_targets_third_word() {
        let msg = decode(b"GET VALUE temperatureSensor").unwrap();
        assert_eq!(msg.method, Method::Get);
        assert_eq!(msg.target.as_deref(), Some("temperatureSensor"));
        assert!(msg.content.is_none());
        assert!(!msg.is_response());
    }

    #[test]
    fn flow_request_content_starts_at_brace() {
        let msg = decode(br#"FLOW VALUE t1 {\"collect\":100,\"publish\":500}"#).unwrap();
        assert_eq!(msg.method, Method::Flow);
        assert_eq!(msg.target.as_deref(), Some("t1"));
        let (collect, publish) = parse_flow_body(msg.content().unwrap()).unwrap();
        assert_eq!((collect, publish), (100, 500));
    }

    #[test]
    fn set_broker_body_accepts_string_port_and_strips_scheme() {
        let raw = r#"SET VALUE brokerMqtt {"id":"b2","url":"tcp://10.0.0.9","port":"1884","user":"u","password":"p"}"#;
        let msg = decode(raw.as_bytes()).unwrap();
        assert_eq!(msg.method, Method::Set);
        assert_eq!(msg.target.as_deref(), Some("brokerMqtt"));
        let endpoint = parse_broker_body(msg.content().unwrap()).unwrap();
        assert_eq!(endpoint, BrokerEndpoint::new("10.0.0.9", 1884).with_credentials("u", "p"));

        let numeric = parse_broker_body(r#"{"url":"10.0.0.9","port":1884}"#).unwrap();
        assert_eq!(numeric.port, 1884);
        assert!(numeric.username.is_empty());
    }

    #[test]
    fn connack_is_a_response() {
        let raw = connack_response("dev1", "dev1", true);
        let msg = decode(raw.as_bytes()).unwrap();
        assert_eq!(msg.method, Method::Connack);
        assert!(msg.is_response());
        assert!(msg.connack_accepted().unwrap());
        assert_eq!(msg.response_name(), Some("dev1"));

        let rejected = decode(connack_response("dev1", "dev1", false).as_bytes()).unwrap();
        assert!(!rejected.connack_accepted().unwrap());
    }

    #[test]
    fn flow_response_targets_sensor_not_flow_key() {
        let raw = flow_response("dev1", "t1", &[11, 12, 13], 100, 300);
        let msg = decode(raw.as_bytes()).unwrap();
        assert_eq!(msg.method, Method::Flow);
        assert_eq!(msg.target.as_deref(), Some("t1"));
        let body = &msg.response.unwrap()["BODY"];
        assert_eq!(body["t1"], json!([11, 12, 13]));
        assert_eq!(body["FLOW"]["collect"], 100);
    }

    #[test]
    fn connect_request_layout() {
        let sensors = vec![SensorSpec {
            id: "t1".into(),
            kind: "temperature".into(),
            collection_time: 100,
            publishing_time: 500,
            min_value: 10,
            max_value: 30,
            delta: 1,
        }];
        let raw = ConnectRequest {
            device_id: "dev1",
            latitude: 1.5,
            longitude: -2.5,
            sensors: &sensors,
            source_ip: Some("192.168.1.4"),
            timeout: Duration::from_secs(10),
        }
        .encode();
        assert!(raw.starts_with("CONNECT VALUE BROKER {"));

        let msg = decode(raw.as_bytes()).unwrap();
        assert_eq!(msg.method, Method::Connect);
        assert_eq!(msg.target.as_deref(), Some("BROKER"));
        let body: Value = serde_json::from_str(msg.content().unwrap()).unwrap();
        assert_eq!(body["TIME_OUT"], 10.0);
        assert_eq!(body["HEADER"]["SOURCE_IP"], "192.168.1.4");
        assert_eq!(body["DEVICE"]["sensors"][0]["type"], "temperature");
    }

    #[test]
    fn unknown_method_is_invalid() {
        let msg = decode(b"DELETE VALUE something").unwrap();
        assert_eq!(msg.method, Method::Invalid);
    }

    #[test]
    fn flow_body_rejects_garbage() {
        assert!(matches!(parse_flow_body(r#"{"collect":"abc","publish":1}"#), Err(CodecError::InvalidField { .. })));
        assert!(matches!(parse_flow_body(r#"{"collect":1}"#), Err(CodecError::MissingField("publish"))));
    }
}
