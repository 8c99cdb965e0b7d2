//! Pub/sub transport boundary
//!
//! The device core only ever talks to a broker through these traits:
//! - `Connector` dials an endpoint and hands back a live `Connection`
//! - `Connection` publishes, subscribes and disconnects
//! - every connection produces its own `EventStream` of inbound traffic
//!
//! `mqtt` holds the rumqttc-backed implementation; tests use the devkit mock.

pub mod mqtt;

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::models::BrokerEndpoint;

pub use rumqttc::QoS;

/// Opaque id of one publish, unique across every connection of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublishHandle(pub u64);

impl fmt::Display for PublishHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic source of publish handles, shared by all connections of one connector
#[derive(Debug, Default)]
pub struct HandleSequence(AtomicU64);

impl HandleSequence {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> PublishHandle {
        PublishHandle(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Inbound traffic of one connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message { topic: String, payload: Vec<u8> },
    /// The broker confirmed delivery of an earlier publish
    DeliveryAck(PublishHandle),
    ConnectionLost(String),
}

pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

#[async_trait]
pub trait Connection: Send + Sync {
    fn endpoint(&self) -> &BrokerEndpoint;

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<PublishHandle, TransportError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolves once the broker accepted the session
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        client_id: &str,
    ) -> Result<(Arc<dyn Connection>, EventStream), TransportError>;
}
