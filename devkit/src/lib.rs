/*!
# FoT DevKit - test doubles for the virtual device

- In-memory MQTT transport (`MockConnector` / `MockConnection`)
- `TestHarness` wiring a full device over the mock transport
- TATU request builders
*/

pub mod mqtt_stub;
pub mod tatu_helpers;
pub mod test_utils;

pub use mqtt_stub::{AutoConnack, MockConnection, MockConnector, MockMessage};
pub use tatu_helpers::{sensor, TatuMessageBuilder};
pub use test_utils::{MemorySink, TestHarness, TestStats};
