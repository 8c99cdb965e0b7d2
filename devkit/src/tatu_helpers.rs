/*!
TATU payload builders for tests

Requests the broker side sends to a device, plus ready-made sensor specs.
Responses the device produces are built by `fot_device::codec`.
*/

use fot_device::{codec, SensorSpec};
use serde_json::json;

pub struct TatuMessageBuilder;

impl TatuMessageBuilder {
    pub fn get_request(sensor_id: &str) -> String {
        format!("GET VALUE {sensor_id}")
    }

    pub fn flow_request(sensor_id: &str, collect: i64, publish: i64) -> String {
        codec::flow_request(sensor_id, collect, publish)
    }

    /// `SET VALUE brokerMqtt {...}` with the port sent as a string, as gateways do
    pub fn set_broker_request(gateway_id: &str, url: &str, port: u16, user: &str, password: &str) -> String {
        let body = json!({
            "id": gateway_id,
            "url": url,
            "port": port.to_string(),
            "user": user,
            "password": password,
        });
        format!("SET VALUE brokerMqtt {body}")
    }

    pub fn connack(device_id: &str, accept: bool) -> String {
        codec::connack_response(device_id, device_id, accept)
    }

    pub fn evt_request(sensor_id: &str) -> String {
        format!("EVT VALUE {sensor_id}")
    }
}

/// Sensor spec with the default value range
pub fn sensor(id: &str, collect_ms: i64, publish_ms: i64) -> SensorSpec {
    SensorSpec {
        id: id.to_string(),
        kind: format!("{id}-type"),
        collection_time: collect_ms,
        publishing_time: publish_ms,
        min_value: 10,
        max_value: 30,
        delta: 1,
    }
}
