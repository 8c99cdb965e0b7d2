//! Inbound command dispatch
//!
//! Drains the device inbox and turns TATU requests into controller calls:
//! - `GET` answers with the sensor's current value on `dev/{id}/RES`
//! - `FLOW` starts, retunes or stops a sensor flow
//! - `SET brokerMqtt` launches a broker migration in the background
//! - delivery acknowledgements feed the latency tracker

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{self, Method, TatuMessage};
use crate::device::DeviceController;
use crate::error::{CodecError, DeviceError, Result};
use crate::migration::MigrationEngine;
use crate::transport::{QoS, TransportEvent};

/// SET target naming the broker to migrate to
const BROKER_TARGET: &str = "brokerMqtt";

pub struct Dispatcher {
    controller: Arc<DeviceController>,
    engine: Arc<MigrationEngine>,
    migration_timeout: Duration,
}

impl Dispatcher {
    pub fn new(controller: Arc<DeviceController>, engine: Arc<MigrationEngine>) -> Self {
        Self {
            controller,
            engine,
            migration_timeout: Duration::from_secs(10),
        }
    }

    /// CONNACK deadline of migrations requested by `SET brokerMqtt`
    pub fn with_migration_timeout(mut self, timeout: Duration) -> Self {
        self.migration_timeout = timeout;
        self
    }

    pub fn spawn(
        self,
        inbox: mpsc::UnboundedReceiver<TransportEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(inbox, shutdown))
    }

    pub async fn run(self, mut inbox: mpsc::UnboundedReceiver<TransportEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = inbox.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                }
            }
        }
        debug!(device = %self.controller.id(), "dispatcher stopped");
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message { topic, payload } => {
                if let Err(e) = self.handle_message(&topic, &payload).await {
                    match e {
                        DeviceError::MalformedMessage(_) => warn!(%topic, "{}", e),
                        _ => error!(%topic, "failed to handle message: {}", e),
                    }
                }
            }
            TransportEvent::DeliveryAck(handle) => {
                self.controller.handle_ack(handle);
            }
            TransportEvent::ConnectionLost(reason) => {
                error!(device = %self.controller.id(), "MQTT connection lost: {}", reason);
            }
        }
    }

    async fn handle_message(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let message = codec::decode(payload)?;
        debug!(
            device = %self.controller.id(),
            %topic,
            method = %message.method,
            subject = message.target.as_deref().unwrap_or_default(),
            "message arrived"
        );

        if message.is_response() {
            debug!(%topic, method = %message.method, "ignoring response");
            return Ok(());
        }

        match message.method {
            Method::Get => self.on_get(&message).await,
            Method::Flow => self.on_flow(&message),
            Method::Set => self.on_set(&message),
            Method::Evt => {
                info!(subject = message.target.as_deref().unwrap_or_default(), "EVT requests are not supported");
                Ok(())
            }
            Method::Post | Method::Connect | Method::Connack => {
                info!(method = %message.method, "no action for this method");
                Ok(())
            }
            Method::Invalid => Err(CodecError::InvalidField {
                field: "method",
                reason: message.raw.clone(),
            }
            .into()),
        }
    }

    async fn on_get(&self, message: &TatuMessage) -> Result<()> {
        let sensor_id = message.target()?;
        let Some(runner) = self.controller.runner(sensor_id) else {
            warn!(sensor = sensor_id, "GET for unknown sensor");
            return Ok(());
        };

        let device_id = self.controller.id();
        let response = codec::get_response(device_id, sensor_id, runner.current_value());
        self.controller
            .publish(&codec::response_topic(device_id), response.into_bytes(), QoS::AtLeastOnce)
            .await?;
        Ok(())
    }

    fn on_flow(&self, message: &TatuMessage) -> Result<()> {
        let sensor_id = message.target()?;
        let Some(runner) = self.controller.runner(sensor_id) else {
            warn!(sensor = sensor_id, "FLOW for unknown sensor");
            return Ok(());
        };

        let (collect, publish) = codec::parse_flow_body(message.content()?)?;
        let state = runner.start(collect, publish);
        debug!(sensor = sensor_id, collect, publish, ?state, "FLOW applied");
        Ok(())
    }

    fn on_set(&self, message: &TatuMessage) -> Result<()> {
        let target = message.target()?;
        if target != BROKER_TARGET {
            info!(subject = target, "ignoring SET for unsupported target");
            return Ok(());
        }
        if self.engine.is_migrating() {
            warn!(device = %self.controller.id(), "broker update already in progress, ignoring SET");
            return Ok(());
        }

        let candidate = codec::parse_broker_body(message.content()?)?;
        info!(device = %self.controller.id(), broker = %candidate, "broker change requested");

        let engine = self.engine.clone();
        let timeout = self.migration_timeout;
        tokio::spawn(async move {
            engine.migrate(candidate, timeout, false).await;
        });
        Ok(())
    }
}
