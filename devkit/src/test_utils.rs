/*!
Test harness for the virtual device

Builds a complete device (controller, migration engine, dispatcher, latency
and telemetry buffers) on top of `MockConnector`, so integration tests can
drive it with TATU requests and assert on what it publishes.
*/

use crate::mqtt_stub::{MockConnection, MockConnector, MockMessage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use fot_device::error::SinkError;
use fot_device::{
    BatchBuffer, BrokerEndpoint, Device, DeviceController, Dispatcher, ExperimentMeta, LatencyRecord, LatencyTracker,
    MigrationEngine, SensorReading, SensorSpec, Sink,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Sink keeping every flushed record in memory
pub struct MemorySink<T> {
    records: Arc<Mutex<Vec<T>>>,
    batches: Arc<Mutex<Vec<usize>>>,
}

impl<T> Clone for MemorySink<T> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            batches: self.batches.clone(),
        }
    }
}

impl<T: Clone> MemorySink<T> {
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            batches: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn records(&self) -> Vec<T> {
        self.records.lock().clone()
    }

    /// Size of each flushed batch, in flush order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }
}

impl<T: Clone> Default for MemorySink<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> Sink<T> for MemorySink<T> {
    async fn flush(&mut self, batch: &[T]) -> Result<(), SinkError> {
        self.records.lock().extend_from_slice(batch);
        self.batches.lock().push(batch.len());
        Ok(())
    }
}

pub struct TestHarness {
    pub connector: MockConnector,
    pub controller: Arc<DeviceController>,
    pub engine: Arc<MigrationEngine>,
    pub latency: Arc<BatchBuffer<LatencyRecord>>,
    pub telemetry: Arc<BatchBuffer<SensorReading>>,
    pub latency_sink: MemorySink<LatencyRecord>,
    pub telemetry_sink: MemorySink<SensorReading>,
    shutdown: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
}

impl TestHarness {
    /// Device with the given sensors, buffers flushing every record
    pub fn new(device_id: &str, sensors: Vec<SensorSpec>) -> Self {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();

        let connector = MockConnector::new();

        let latency_sink = MemorySink::new();
        let latency = Arc::new(BatchBuffer::new("latency", 1));
        latency.start(latency_sink.clone());

        let telemetry_sink = MemorySink::new();
        let telemetry = Arc::new(BatchBuffer::new("telemetry", 1));
        telemetry.start(telemetry_sink.clone());

        let tracker = LatencyTracker::new(device_id, ExperimentMeta::default()).with_output(latency.clone());
        let controller = DeviceController::new(
            Device::new(device_id, sensors),
            Arc::new(connector.clone()),
            Arc::new(tracker),
            telemetry.clone(),
        );
        let engine = Arc::new(MigrationEngine::new(controller.clone()).with_retry_interval(Duration::from_millis(100)));

        Self {
            connector,
            controller,
            engine,
            latency,
            telemetry,
            latency_sink,
            telemetry_sink,
            shutdown: CancellationToken::new(),
            dispatcher: None,
        }
    }

    /// Start consuming the device inbox
    pub fn with_dispatcher(mut self) -> Self {
        if let Some(inbox) = self.controller.take_inbox() {
            let dispatcher = Dispatcher::new(self.controller.clone(), self.engine.clone());
            self.dispatcher = Some(dispatcher.spawn(inbox, self.shutdown.clone()));
        }
        self
    }

    /// Plain connect to `host:1883` and return the mock session
    pub async fn connect(&self, host: &str) -> Result<MockConnection> {
        self.controller
            .connect(&BrokerEndpoint::new(host, 1883))
            .await
            .with_context(|| format!("connect to {host}"))?;
        self.connector
            .connection_to(host)
            .with_context(|| format!("no mock connection to {host}"))
    }

    /// Connection currently installed in the device
    pub fn active_connection(&self) -> Option<MockConnection> {
        let endpoint = self.controller.slot().endpoint()?;
        self.connector.connection_to(&endpoint.host)
    }

    /// Wait until a message shows up on `topic` of `connection`
    pub async fn wait_for_message(&self, connection: &MockConnection, topic: &str, timeout_ms: u64) -> Option<MockMessage> {
        let found = self
            .wait_until(timeout_ms, || !connection.find_messages_by_topic(topic).is_empty())
            .await;
        if !found {
            warn!("Timeout waiting for message on {}", topic);
            return None;
        }
        connection.last_message_on(topic)
    }

    /// Poll `condition` every 10 ms until it holds or `timeout_ms` elapses
    pub async fn wait_until<F>(&self, timeout_ms: u64, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let poll = async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_millis(timeout_ms), poll).await.is_ok()
    }

    pub async fn get_stats(&self) -> TestStats {
        let mut topic_counts = HashMap::new();
        let mut total_messages = 0;
        for connection in self.connector.connections() {
            for msg in connection.get_published_messages() {
                *topic_counts.entry(msg.topic).or_insert(0) += 1;
                total_messages += 1;
            }
        }

        TestStats {
            total_messages,
            topic_counts,
            connections: self.connector.connections().len(),
            in_flight: self.controller.tracker().in_flight(),
            latency_records: self.latency_sink.records().len(),
            readings: self.telemetry_sink.records().len(),
        }
    }

    /// Stop flows, the dispatcher and both buffers
    pub async fn shutdown(mut self) {
        self.controller.stop_all_flows();
        self.shutdown.cancel();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.await;
        }
        self.latency.stop().await;
        self.telemetry.stop().await;
        self.controller.shutdown().await;
        info!("Test harness shut down");
    }
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub connections: usize,
    pub in_flight: usize,
    pub latency_records: usize,
    pub readings: usize,
}

impl TestStats {
    pub fn print(&self) {
        println!("Test statistics:");
        println!("  Published messages: {}", self.total_messages);
        for (topic, count) in &self.topic_counts {
            println!("    {}: {}", topic, count);
        }
        println!("  Connections opened: {}", self.connections);
        println!("  In flight: {}", self.in_flight);
        println!("  Latency records: {}", self.latency_records);
        println!("  Readings: {}", self.readings);
    }
}
