//! rumqttc implementation of the transport traits
//!
//! One event-loop task per connection. Publish handles are matched to MQTT
//! packet ids through the `Outgoing::Publish(pkid)` events, which the event
//! loop emits in the same order the client queued the publishes.

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{Connection, Connector, EventStream, HandleSequence, PublishHandle, TransportEvent};
use crate::error::TransportError;
use crate::models::BrokerEndpoint;
use crate::net;

const REQUEST_CAPACITY: usize = 64;

/// Dials MQTT brokers with rumqttc
pub struct MqttConnector {
    handles: Arc<HandleSequence>,
    connect_timeout: Duration,
    keep_alive: Duration,
}

impl MqttConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            handles: Arc::new(HandleSequence::new()),
            connect_timeout,
            keep_alive: Duration::from_secs(15),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// Handle bookkeeping shared between the client side and the event loop
#[derive(Debug, Default)]
struct Inflight {
    /// Handles whose publish has been queued but not yet written out
    queued: VecDeque<PublishHandle>,
    /// Handles waiting for PUBACK/PUBCOMP, by packet id
    awaiting_ack: HashMap<u16, PublishHandle>,
}

impl Inflight {
    fn on_queued(&mut self, handle: PublishHandle) {
        self.queued.push_back(handle);
    }

    /// The client refused the publish queued last
    fn on_send_failed(&mut self) {
        self.queued.pop_back();
    }

    /// Pair the oldest queued handle with the packet id it went out with
    ///
    /// Returns false when nothing was queued.
    fn on_outgoing(&mut self, pkid: u16) -> bool {
        match self.queued.pop_front() {
            // QoS 0 publishes carry pkid 0 and never get acknowledged
            Some(handle) if pkid != 0 => {
                self.awaiting_ack.insert(pkid, handle);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    fn on_ack(&mut self, pkid: u16) -> Option<PublishHandle> {
        self.awaiting_ack.remove(&pkid)
    }
}

pub struct MqttConnection {
    endpoint: BrokerEndpoint,
    client: AsyncClient,
    handles: Arc<HandleSequence>,
    inflight: Arc<Mutex<Inflight>>,
    /// Keeps handle push and client enqueue in the same order
    publish_order: tokio::sync::Mutex<()>,
    closing: Arc<AtomicBool>,
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        client_id: &str,
    ) -> Result<(Arc<dyn Connection>, EventStream), TransportError> {
        let mut options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if endpoint.has_credentials() {
            options.set_credentials(endpoint.username.clone(), endpoint.password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        match tokio::time::timeout(self.connect_timeout, wait_for_connack(&mut eventloop, endpoint)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TransportError::ConnectTimeout {
                    uri: endpoint.uri(),
                    timeout: self.connect_timeout,
                })
            }
        }

        match net::route_to(endpoint).await {
            Some(local) => info!(client_id, %local, remote = %endpoint.uri(), "MQTT socket connected"),
            None => info!(client_id, remote = %endpoint.uri(), "MQTT socket connected"),
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inflight = Arc::new(Mutex::new(Inflight::default()));
        let closing = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_event_loop(
            eventloop,
            endpoint.uri(),
            inflight.clone(),
            closing.clone(),
            events_tx,
        ));

        let connection = MqttConnection {
            endpoint: endpoint.clone(),
            client,
            handles: self.handles.clone(),
            inflight,
            publish_order: tokio::sync::Mutex::new(()),
            closing,
        };

        Ok((Arc::new(connection), events_rx))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop, endpoint: &BrokerEndpoint) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(TransportError::Connect {
                        uri: endpoint.uri(),
                        reason: format!("{:?}", ack.code),
                    })
                };
            }
            Ok(_) => {}
            Err(e) => {
                return Err(TransportError::Connect {
                    uri: endpoint.uri(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    uri: String,
    inflight: Arc<Mutex<Inflight>>,
    closing: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let _ = events.send(TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Incoming::PubAck(ack))) => resolve(&inflight, ack.pkid, &events),
            Ok(Event::Incoming(Incoming::PubComp(comp))) => resolve(&inflight, comp.pkid, &events),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                if !inflight.lock().on_outgoing(pkid) {
                    warn!(%uri, pkid, "outgoing publish with no queued handle");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(%uri, "MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if !closing.load(Ordering::SeqCst) {
                    error!(%uri, "MQTT connection lost: {}", e);
                    let _ = events.send(TransportEvent::ConnectionLost(e.to_string()));
                }
                break;
            }
        }
    }
    debug!(%uri, "MQTT event loop stopped");
}

fn resolve(inflight: &Mutex<Inflight>, pkid: u16, events: &mpsc::UnboundedSender<TransportEvent>) {
    let handle = inflight.lock().on_ack(pkid);
    if let Some(handle) = handle {
        let _ = events.send(TransportEvent::DeliveryAck(handle));
    }
}

#[async_trait]
impl Connection for MqttConnection {
    fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<PublishHandle, TransportError> {
        let _order = self.publish_order.lock().await;
        let handle = self.handles.next();
        self.inflight.lock().on_queued(handle);

        if let Err(e) = self.client.publish(topic, qos, false, payload).await {
            self.inflight.lock().on_send_failed();
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(handle)
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::Disconnect(e.to_string()))
    }
}
