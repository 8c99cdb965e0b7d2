//! FoT virtual device
//!
//! Simulates an IoT device for Fog-of-Things experiments:
//! - virtual sensors publishing bounded random-walk telemetry over MQTT
//! - publish → acknowledgement latency measurement, batched to a REST API and CSV
//! - live migration between brokers through the TATU CONNECT/CONNACK handshake
//! - remote control through TATU GET/SET/FLOW commands

pub mod buffer;
pub mod codec;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod latency;
pub mod migration;
pub mod models;
pub mod net;
pub mod sensor;
pub mod sinks;
pub mod transport;

pub use buffer::{BatchBuffer, Sink};
pub use device::{ConnectionSlot, Device, DeviceController};
pub use dispatch::Dispatcher;
pub use error::{DeviceError, Result};
pub use latency::LatencyTracker;
pub use migration::{MigrationEngine, MigrationOutcome, MigrationState, RollbackReason};
pub use models::{BrokerEndpoint, ExperimentMeta, LatencyRecord, Lifecycle, SensorReading, SensorSpec};
pub use sensor::SensorFlowRunner;
