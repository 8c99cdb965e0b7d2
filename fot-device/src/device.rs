//! Device controller
//!
//! Owns the device identity, the sensors and the single active broker
//! connection. The active connection lives in a `ConnectionSlot`: readers
//! clone the `Arc` out of it, a migration commit swaps it in one step.
//! Inbound traffic of every adopted connection is pumped into one inbox that
//! the dispatcher consumes.

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::buffer::BatchBuffer;
use crate::codec;
use crate::error::{DeviceError, Result};
use crate::latency::LatencyTracker;
use crate::models::{BrokerEndpoint, SensorReading, SensorSpec};
use crate::sensor::{FlowContext, SensorFlowRunner};
use crate::transport::{Connection, Connector, EventStream, PublishHandle, QoS, TransportEvent};

/// Holder of the active connection
#[derive(Default)]
pub struct ConnectionSlot {
    active: RwLock<Option<Arc<dyn Connection>>>,
}

impl ConnectionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<dyn Connection>> {
        self.active.read().clone()
    }

    /// Install `connection`, returning the previous one
    pub fn replace(&self, connection: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        self.active.write().replace(connection)
    }

    pub fn take(&self) -> Option<Arc<dyn Connection>> {
        self.active.write().take()
    }

    pub fn endpoint(&self) -> Option<BrokerEndpoint> {
        self.active.read().as_ref().map(|c| c.endpoint().clone())
    }

    pub fn is_connected(&self) -> bool {
        self.active.read().is_some()
    }
}

/// Identity of the virtual device
#[derive(Debug)]
pub struct Device {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub sensors: Vec<SensorSpec>,
    migrating: AtomicBool,
}

impl Device {
    /// Coordinates are drawn at random
    pub fn new(id: impl Into<String>, sensors: Vec<SensorSpec>) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            id: id.into(),
            latitude: rng.gen_range(-90.0..=90.0),
            longitude: rng.gen_range(-180.0..=180.0),
            sensors,
            migrating: AtomicBool::new(false),
        }
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating.load(Ordering::SeqCst)
    }

    /// Claim the single migration slot; false when one is already in progress
    pub(crate) fn begin_migration(&self) -> bool {
        self.migrating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end_migration(&self) {
        self.migrating.store(false, Ordering::SeqCst);
    }
}

pub struct DeviceController {
    device: Arc<Device>,
    connector: Arc<dyn Connector>,
    slot: Arc<ConnectionSlot>,
    tracker: Arc<LatencyTracker>,
    runners: Vec<SensorFlowRunner>,
    inbox_tx: mpsc::UnboundedSender<TransportEvent>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl DeviceController {
    pub fn new(
        device: Device,
        connector: Arc<dyn Connector>,
        tracker: Arc<LatencyTracker>,
        telemetry: Arc<BatchBuffer<SensorReading>>,
    ) -> Arc<Self> {
        let device = Arc::new(device);
        let slot = Arc::new(ConnectionSlot::new());
        let ctx = Arc::new(FlowContext {
            device_id: device.id.clone(),
            slot: slot.clone(),
            tracker: tracker.clone(),
            telemetry,
        });
        let runners = device
            .sensors
            .iter()
            .cloned()
            .map(|spec| SensorFlowRunner::new(spec, ctx.clone()))
            .collect();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            device,
            connector,
            slot,
            tracker,
            runners,
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn id(&self) -> &str {
        &self.device.id
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn slot(&self) -> &Arc<ConnectionSlot> {
        &self.slot
    }

    pub fn tracker(&self) -> &Arc<LatencyTracker> {
        &self.tracker
    }

    pub fn runners(&self) -> &[SensorFlowRunner] {
        &self.runners
    }

    pub fn runner(&self, sensor_id: &str) -> Option<&SensorFlowRunner> {
        self.runners.iter().find(|r| r.id() == sensor_id)
    }

    /// Dial `endpoint` directly and make it the active connection
    pub async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<()> {
        let (connection, events) = self
            .connector
            .connect(endpoint, &self.device.id)
            .await
            .map_err(DeviceError::Connection)?;
        self.adopt(connection, events).await
    }

    /// Make an established connection the active one
    ///
    /// The command subscription is in place before the swap, and the previous
    /// connection is only closed once the new one is live.
    pub async fn adopt(&self, connection: Arc<dyn Connection>, events: EventStream) -> Result<()> {
        connection
            .subscribe(&codec::command_topic(&self.device.id), QoS::ExactlyOnce)
            .await
            .map_err(DeviceError::Connection)?;

        let endpoint = connection.endpoint().clone();
        let previous = self.slot.replace(connection);
        tokio::spawn(pump(events, self.inbox_tx.clone()));
        info!(device = %self.device.id, broker = %endpoint, "active broker connection set");

        if let Some(previous) = previous {
            debug!(device = %self.device.id, broker = %previous.endpoint(), "closing previous connection");
            if let Err(e) = previous.disconnect().await {
                warn!(device = %self.device.id, "failed to close previous connection: {}", e);
            }
        }
        Ok(())
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<PublishHandle> {
        let connection = self.slot.current().ok_or(DeviceError::NotConnected)?;
        connection
            .publish(topic, payload, qos)
            .await
            .map_err(DeviceError::Publish)
    }

    pub fn handle_ack(&self, handle: PublishHandle) -> bool {
        self.tracker.on_ack(handle)
    }

    pub fn start_all_flows(&self) {
        for runner in &self.runners {
            runner.start_default();
        }
    }

    /// Pause every running flow and return the ids actually paused
    pub fn pause_all_flows(&self) -> Vec<String> {
        self.runners
            .iter()
            .filter(|r| r.pause())
            .map(|r| r.id().to_string())
            .collect()
    }

    pub fn resume_flows(&self, sensor_ids: &[String]) {
        for id in sensor_ids {
            if let Some(runner) = self.runner(id) {
                runner.resume();
            }
        }
    }

    pub fn stop_all_flows(&self) {
        for runner in &self.runners {
            runner.stop();
        }
    }

    /// The merged inbound stream; handed out once
    pub fn take_inbox(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inbox_rx.lock().take()
    }

    pub async fn shutdown(&self) {
        self.stop_all_flows();
        if let Some(connection) = self.slot.take() {
            if let Err(e) = connection.disconnect().await {
                warn!(device = %self.device.id, "disconnect failed: {}", e);
            }
        }
        info!(device = %self.device.id, "device shut down");
    }
}

async fn pump(mut events: EventStream, inbox: mpsc::UnboundedSender<TransportEvent>) {
    while let Some(event) = events.recv().await {
        if inbox.send(event).is_err() {
            break;
        }
    }
}
