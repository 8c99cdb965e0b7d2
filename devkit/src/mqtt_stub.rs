/*!
In-memory MQTT transport for tests

`MockConnector` stands in for a broker fleet: every `connect` produces a
`MockConnection` that records what the device publishes, subscribes and
disconnects, and lets the test push inbound messages, delivery
acknowledgements or connection losses into the device.
*/

use async_trait::async_trait;
use fot_device::error::TransportError;
use fot_device::transport::{Connection, Connector, EventStream, HandleSequence, PublishHandle, TransportEvent};
use fot_device::{codec, BrokerEndpoint};
use parking_lot::Mutex;
use rumqttc::QoS;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub handle: PublishHandle,
}

impl MockMessage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Broker answer to a CONNECT, sent automatically after `delay`
#[derive(Debug, Clone, Copy)]
pub struct AutoConnack {
    pub accept: bool,
    pub delay: Duration,
}

struct ConnectionInner {
    endpoint: BrokerEndpoint,
    client_id: String,
    handles: Arc<HandleSequence>,
    published: Mutex<Vec<MockMessage>>,
    subscriptions: Mutex<Vec<String>>,
    unsubscriptions: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    disconnects: AtomicUsize,
    fail_publish: AtomicBool,
    auto_ack: AtomicBool,
    connack: Mutex<Option<AutoConnack>>,
}

/// One simulated broker session
#[derive(Clone)]
pub struct MockConnection {
    inner: Arc<ConnectionInner>,
}

impl MockConnection {
    fn new(endpoint: BrokerEndpoint, client_id: &str, handles: Arc<HandleSequence>) -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                endpoint,
                client_id: client_id.to_string(),
                handles,
                published: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                unsubscriptions: Mutex::new(Vec::new()),
                events: Mutex::new(Some(tx)),
                disconnects: AtomicUsize::new(0),
                fail_publish: AtomicBool::new(false),
                auto_ack: AtomicBool::new(false),
                connack: Mutex::new(None),
            }),
        };
        (connection, rx)
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.inner.endpoint
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    fn emit(&self, event: TransportEvent) -> bool {
        match self.inner.events.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver a message to the device as if the broker routed it
    pub fn inject_message(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> bool {
        let topic = topic.into();
        debug!("[MOCK] incoming on {}", topic);
        self.emit(TransportEvent::Message {
            topic,
            payload: payload.into(),
        })
    }

    pub fn inject_ack(&self, handle: PublishHandle) -> bool {
        self.emit(TransportEvent::DeliveryAck(handle))
    }

    /// Report a lost connection and close the event stream
    pub fn inject_connection_lost(&self, reason: &str) -> bool {
        let sent = self.emit(TransportEvent::ConnectionLost(reason.to_string()));
        self.inner.events.lock().take();
        sent
    }

    /// Acknowledge every publish right after it is recorded
    pub fn set_auto_ack(&self, enabled: bool) {
        self.inner.auto_ack.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_auto_connack(&self, connack: Option<AutoConnack>) {
        *self.inner.connack.lock() = connack;
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.inner.published.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    pub fn last_message_on(&self, topic: &str) -> Option<MockMessage> {
        self.find_messages_by_topic(topic).pop()
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.lock().clone()
    }

    pub fn get_unsubscriptions(&self) -> Vec<String> {
        self.inner.unsubscriptions.lock().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnect_count() > 0
    }

    pub fn disconnect_count(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.inner.published.lock().clear();
        self.inner.subscriptions.lock().clear();
        self.inner.unsubscriptions.lock().clear();
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn endpoint(&self) -> &BrokerEndpoint {
        &self.inner.endpoint
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<PublishHandle, TransportError> {
        if self.is_disconnected() {
            return Err(TransportError::Closed);
        }
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "mock publish failure".into(),
            });
        }

        let handle = self.inner.handles.next();
        self.inner.published.lock().push(MockMessage {
            topic: topic.to_string(),
            payload,
            qos,
            handle,
        });
        debug!("[MOCK] {} published on {} ({})", self.inner.endpoint, topic, handle);

        if self.inner.auto_ack.load(Ordering::SeqCst) {
            self.inject_ack(handle);
        }

        if topic == codec::CONNECTIONS_TOPIC {
            let connack = *self.inner.connack.lock();
            if let Some(AutoConnack { accept, delay }) = connack {
                let connection = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let reply = codec::connack_response(connection.client_id(), connection.client_id(), accept);
                    connection.inject_message(codec::CONNECTIONS_RESPONSE_TOPIC, reply);
                });
            }
        }
        Ok(handle)
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        if self.is_disconnected() {
            return Err(TransportError::Closed);
        }
        self.inner.subscriptions.lock().push(topic.to_string());
        debug!("[MOCK] {} subscribed to {}", self.inner.endpoint, topic);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.inner.unsubscriptions.lock().push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        self.inner.events.lock().take();
        info!("[MOCK] {} disconnected", self.inner.endpoint);
        Ok(())
    }
}

#[derive(Default)]
struct ConnectorState {
    connections: Vec<MockConnection>,
    attempts: Vec<BrokerEndpoint>,
    unreachable: HashSet<String>,
    failures_left: usize,
    connacks: HashMap<String, AutoConnack>,
    auto_ack: bool,
}

/// Hands out `MockConnection`s, sharing one handle sequence like a real connector
#[derive(Clone)]
pub struct MockConnector {
    handles: Arc<HandleSequence>,
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            handles: Arc::new(HandleSequence::new()),
            state: Arc::new(Mutex::new(ConnectorState::default())),
        }
    }

    /// Every connect to `host` fails until `set_reachable`
    pub fn set_unreachable(&self, host: &str) {
        self.state.lock().unreachable.insert(host.to_string());
    }

    pub fn set_reachable(&self, host: &str) {
        self.state.lock().unreachable.remove(host);
    }

    /// The next `count` connects fail whatever the host
    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().failures_left = count;
    }

    /// Connections to `host` answer CONNECT with a CONNACK after `delay`
    pub fn auto_connack(&self, host: &str, accept: bool, delay: Duration) {
        self.state
            .lock()
            .connacks
            .insert(host.to_string(), AutoConnack { accept, delay });
    }

    /// New connections acknowledge every publish immediately
    pub fn set_auto_ack(&self, enabled: bool) {
        self.state.lock().auto_ack = enabled;
    }

    pub fn connections(&self) -> Vec<MockConnection> {
        self.state.lock().connections.clone()
    }

    /// Most recent connection opened to `host`
    pub fn connection_to(&self, host: &str) -> Option<MockConnection> {
        self.state
            .lock()
            .connections
            .iter()
            .rev()
            .find(|c| c.endpoint().host == host)
            .cloned()
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().attempts.len()
    }

    pub fn attempts_to(&self, host: &str) -> usize {
        self.state.lock().attempts.iter().filter(|e| e.host == host).count()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        client_id: &str,
    ) -> Result<(Arc<dyn Connection>, EventStream), TransportError> {
        let mut state = self.state.lock();
        state.attempts.push(endpoint.clone());

        if state.failures_left > 0 || state.unreachable.contains(&endpoint.host) {
            state.failures_left = state.failures_left.saturating_sub(1);
            return Err(TransportError::Connect {
                uri: endpoint.uri(),
                reason: "mock broker unreachable".into(),
            });
        }

        let (connection, events) = MockConnection::new(endpoint.clone(), client_id, self.handles.clone());
        connection.set_auto_ack(state.auto_ack);
        connection.set_auto_connack(state.connacks.get(&endpoint.host).copied());
        state.connections.push(connection.clone());
        info!("[MOCK] {} connected to {}", client_id, endpoint);

        Ok((Arc::new(connection), events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_publish_and_subscribe() {
        let connector = MockConnector::new();
        let endpoint = BrokerEndpoint::new("broker-a", 1883);
        let (conn, _events) = connector.connect(&endpoint, "dev1").await.unwrap();

        conn.subscribe("dev/dev1", QoS::ExactlyOnce).await.unwrap();
        let handle = conn.publish("dev/dev1/RES", b"hello".to_vec(), QoS::AtLeastOnce).await.unwrap();

        let mock = connector.connection_to("broker-a").unwrap();
        assert_eq!(mock.get_subscriptions(), vec!["dev/dev1"]);
        let messages = mock.find_messages_by_topic("dev/dev1/RES");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].handle, handle);
        assert_eq!(messages[0].text(), "hello");
    }

    #[tokio::test]
    async fn handles_are_unique_across_connections() {
        let connector = MockConnector::new();
        let (a, _ea) = connector.connect(&BrokerEndpoint::new("a", 1883), "dev1").await.unwrap();
        let (b, _eb) = connector.connect(&BrokerEndpoint::new("b", 1883), "dev1").await.unwrap();

        let ha = a.publish("t", vec![], QoS::AtLeastOnce).await.unwrap();
        let hb = b.publish("t", vec![], QoS::AtLeastOnce).await.unwrap();
        assert_ne!(ha, hb);
    }

    #[tokio::test]
    async fn disconnect_closes_event_stream() {
        let connector = MockConnector::new();
        let (conn, mut events) = connector.connect(&BrokerEndpoint::new("a", 1883), "dev1").await.unwrap();

        let mock = connector.connection_to("a").unwrap();
        assert!(mock.inject_message("dev/dev1", "GET VALUE t1 now"));
        conn.disconnect().await.unwrap();

        assert!(matches!(events.recv().await, Some(TransportEvent::Message { .. })));
        assert!(events.recv().await.is_none());
        assert!(mock.is_disconnected());
        assert!(conn.publish("t", vec![], QoS::AtLeastOnce).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_hosts_fail_to_connect() {
        let connector = MockConnector::new();
        connector.set_unreachable("down");
        let result = connector.connect(&BrokerEndpoint::new("down", 1883), "dev1").await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
        assert_eq!(connector.attempts_to("down"), 1);
        assert!(connector.connections().is_empty());
    }
}
