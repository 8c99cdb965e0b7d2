//! FoT virtual device - process bootstrap
//!
//! Loads the configuration and sensors, wires the latency/telemetry buffers
//! to their sinks, connects to the initial broker and runs until Ctrl-C.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fot_device::config::{load_config, load_sensors};
use fot_device::sinks::{FileSink, HttpSink};
use fot_device::transport::mqtt::MqttConnector;
use fot_device::{
    BatchBuffer, Device, DeviceController, DeviceError, Dispatcher, LatencyRecord, LatencyTracker, MigrationEngine,
    MigrationOutcome, SensorReading,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // a missing .env is fine

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fot_device=info")))
        .init();

    info!("FoT virtual device starting...");

    let config = load_config().await.context("Failed to load configuration")?;
    let sensors = load_sensors(&config.sensors_file)
        .await
        .with_context(|| format!("Failed to load sensors from {}", config.sensors_file))?;
    info!(
        device = %config.device_id,
        broker = %config.endpoint(),
        experiment = config.experiment.number,
        sensors = sensors.len(),
        "configuration loaded"
    );

    // latency records always go to the API, optionally to a CSV file too
    let buffer_size = config.experiment.buffer_size;
    let api_buffer = Arc::new(BatchBuffer::<LatencyRecord>::new("latency-api", buffer_size));
    let api_sink = HttpSink::new(config.experiment.api_url.clone());
    info!(url = api_sink.url(), "latency records go to the REST API");
    api_buffer.start(api_sink);
    let mut tracker = LatencyTracker::new(config.device_id.clone(), config.experiment_meta()).with_output(api_buffer.clone());

    let latency_file = if config.experiment.log_latency {
        let buffer = Arc::new(BatchBuffer::<LatencyRecord>::new("latency-file", buffer_size));
        let sink = FileSink::open(&config.output_dir, &config.latency_file_name())
            .context("Failed to open latency log file")?;
        buffer.start(sink);
        tracker = tracker.with_output(buffer.clone());
        Some(buffer)
    } else {
        None
    };

    // telemetry stays closed (and drops readings) unless persistence is on
    let telemetry = Arc::new(BatchBuffer::<SensorReading>::new("telemetry", buffer_size));
    if config.experiment.persist_messages {
        let sink = FileSink::open(&config.output_dir, &config.telemetry_file_name())
            .context("Failed to open telemetry file")?;
        telemetry.start(sink);
    }

    let connector = Arc::new(MqttConnector::new(config.connect_timeout()));
    let controller = DeviceController::new(
        Device::new(config.device_id.clone(), sensors),
        connector,
        Arc::new(tracker),
        telemetry.clone(),
    );
    let engine = Arc::new(MigrationEngine::new(controller.clone()).with_retry_interval(config.retry_interval()));

    let shutdown = CancellationToken::new();
    let inbox = controller.take_inbox().context("Device inbox already taken")?;
    let dispatcher = Dispatcher::new(controller.clone(), engine.clone()).spawn(inbox, shutdown.clone());

    let endpoint = config.endpoint();
    if config.handshake_on_start {
        match engine.migrate(endpoint.clone(), config.connect_timeout(), true).await {
            MigrationOutcome::Committed => {}
            MigrationOutcome::RolledBack(reason) => {
                return Err(DeviceError::from(reason))
                    .with_context(|| format!("Initial handshake with {} failed", endpoint));
            }
            MigrationOutcome::Busy => bail!("Initial connection raced with another migration"),
        }
    } else {
        controller
            .connect(&endpoint)
            .await
            .with_context(|| format!("Failed to connect to {}", endpoint))?;
    }

    controller.start_all_flows();
    info!(device = %controller.id(), broker = %endpoint, "device running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutting down...");

    controller.stop_all_flows();
    shutdown.cancel();
    if let Err(e) = dispatcher.await {
        warn!("dispatcher task failed: {}", e);
    }

    telemetry.stop().await;
    api_buffer.stop().await;
    if let Some(buffer) = latency_file {
        buffer.stop().await;
    }

    controller.shutdown().await;
    Ok(())
}
