//! Publish → acknowledgement latency correlation
//!
//! Every tracked publish is remembered under its `PublishHandle`; when the
//! transport reports the matching delivery acknowledgement, one
//! `LatencyRecord` is pushed to each output buffer.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::buffer::BatchBuffer;
use crate::error::{DeviceError, Result};
use crate::models::{ExperimentMeta, LatencyRecord};
use crate::transport::{Connection, PublishHandle, QoS};

/// How long an ack for a not-yet-registered handle is kept around
const EARLY_ACK_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct InFlightMessage {
    pub broker_host: String,
    pub sensor_id: String,
    pub payload: String,
    pub sent_at: Instant,
}

#[derive(Default)]
struct Pending {
    in_flight: HashMap<PublishHandle, InFlightMessage>,
    /// Acks that overtook the publish call which produced their handle
    early_acks: HashMap<PublishHandle, Instant>,
}

pub struct LatencyTracker {
    device_id: String,
    experiment: ExperimentMeta,
    pending: Mutex<Pending>,
    outputs: Vec<Arc<BatchBuffer<LatencyRecord>>>,
}

impl LatencyTracker {
    pub fn new(device_id: impl Into<String>, experiment: ExperimentMeta) -> Self {
        Self {
            device_id: device_id.into(),
            experiment,
            pending: Mutex::new(Pending::default()),
            outputs: Vec::new(),
        }
    }

    /// Every emitted record goes to each registered buffer
    pub fn with_output(mut self, buffer: Arc<BatchBuffer<LatencyRecord>>) -> Self {
        self.outputs.push(buffer);
        self
    }

    /// Publish with exactly-once delivery and start timing it
    ///
    /// No lock is held while the transport sends. An ack that reaches
    /// `on_ack` before the handle is registered here is parked and matched
    /// when the publish returns.
    pub async fn publish_and_track(
        &self,
        connection: &dyn Connection,
        topic: &str,
        sensor_id: &str,
        payload: String,
    ) -> Result<PublishHandle> {
        let sent_at = Instant::now();
        let handle = connection
            .publish(topic, payload.clone().into_bytes(), QoS::ExactlyOnce)
            .await
            .map_err(DeviceError::Publish)?;

        let message = InFlightMessage {
            broker_host: connection.endpoint().host.clone(),
            sensor_id: sensor_id.to_string(),
            payload,
            sent_at,
        };

        let mut pending = self.pending.lock();
        match pending.early_acks.remove(&handle) {
            Some(acked_at) => {
                drop(pending);
                self.emit(handle, message, acked_at);
            }
            None => {
                pending.in_flight.insert(handle, message);
            }
        }
        Ok(handle)
    }

    /// Returns true iff the handle was tracked and a record was emitted
    pub fn on_ack(&self, handle: PublishHandle) -> bool {
        let now = Instant::now();
        let message = {
            let mut pending = self.pending.lock();
            match pending.in_flight.remove(&handle) {
                Some(message) => message,
                None => {
                    pending
                        .early_acks
                        .retain(|_, acked_at| now.duration_since(*acked_at) <= EARLY_ACK_WINDOW);
                    pending.early_acks.insert(handle, now);
                    debug!(%handle, "ack for untracked publish");
                    return false;
                }
            }
        };
        self.emit(handle, message, now);
        true
    }

    fn emit(&self, handle: PublishHandle, message: InFlightMessage, acked_at: Instant) {
        let record = LatencyRecord {
            device_id: self.device_id.clone(),
            sensor_id: message.sensor_id,
            broker_ip: message.broker_host,
            experiment: self.experiment.number,
            kind: self.experiment.kind,
            level: self.experiment.level,
            latency: acked_at.duration_since(message.sent_at),
            message: message.payload,
        };
        debug!(%handle, sensor = %record.sensor_id, latency_ns = record.latency.as_nanos() as u64, "publish acknowledged");

        for output in &self.outputs {
            output.put(record.clone());
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().in_flight.len()
    }

    /// Drop entries older than `max_age`; never called by the tracker itself
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.in_flight.len();
        pending.in_flight.retain(|_, message| message.sent_at.elapsed() <= max_age);
        let evicted = before - pending.in_flight.len();
        if evicted > 0 {
            warn!(evicted, "evicted unacknowledged publishes");
        }
        evicted
    }
}
