//! Virtual sensors
//!
//! Each sensor produces a bounded random walk. While its flow is Running, a
//! dedicated task samples every `collect` ms and publishes the accumulated
//! values once `publish` ms worth of samples have been gathered.
//!
//! Idle --start--> Running --pause--> Paused --resume--> Running
//! Running|Paused --stop--> Idle, Running --publish failure--> Idle

use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::buffer::BatchBuffer;
use crate::codec;
use crate::device::ConnectionSlot;
use crate::error::{DeviceError, Result};
use crate::latency::LatencyTracker;
use crate::models::{Lifecycle, SensorReading, SensorSpec};

/// Bounded random walk: each step moves by ±delta and is clamped to [min, max]
#[derive(Debug, Clone)]
pub struct ValueWalk {
    value: i64,
    min: i64,
    max: i64,
    delta: i64,
}

impl ValueWalk {
    /// Starts from a value drawn uniformly in [min, max]
    pub fn new(spec: &SensorSpec) -> Self {
        let (min, max) = (spec.min_value.min(spec.max_value), spec.max_value.max(spec.min_value));
        Self {
            value: rand::thread_rng().gen_range(min..=max),
            min,
            max,
            delta: spec.delta,
        }
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn step<R: Rng>(&mut self, rng: &mut R) -> i64 {
        let variation = if rng.gen::<bool>() { self.delta } else { self.delta.saturating_neg() };
        self.value = self.value.saturating_add(variation).clamp(self.min, self.max);
        self.value
    }
}

/// What a running flow needs from its device
pub struct FlowContext {
    pub device_id: String,
    pub slot: Arc<ConnectionSlot>,
    pub tracker: Arc<LatencyTracker>,
    pub telemetry: Arc<BatchBuffer<SensorReading>>,
}

struct FlowState {
    lifecycle: Lifecycle,
    collect: i64,
    publish: i64,
    /// Bumped on every start/pause/stop so a stale loop cannot change the state
    generation: u64,
    cancel: Option<CancellationToken>,
    walk: ValueWalk,
}

struct RunnerInner {
    spec: SensorSpec,
    ctx: Arc<FlowContext>,
    state: Mutex<FlowState>,
}

#[derive(Clone)]
pub struct SensorFlowRunner {
    inner: Arc<RunnerInner>,
}

impl SensorFlowRunner {
    pub fn new(spec: SensorSpec, ctx: Arc<FlowContext>) -> Self {
        let state = FlowState {
            lifecycle: Lifecycle::Idle,
            collect: spec.collection_time,
            publish: spec.publishing_time,
            generation: 0,
            cancel: None,
            walk: ValueWalk::new(&spec),
        };
        Self {
            inner: Arc::new(RunnerInner {
                spec,
                ctx,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn spec(&self) -> &SensorSpec {
        &self.inner.spec
    }

    pub fn id(&self) -> &str {
        &self.inner.spec.id
    }

    pub fn state(&self) -> Lifecycle {
        self.inner.state.lock().lifecycle
    }

    /// Current (collect, publish) cadences in milliseconds
    pub fn cadence(&self) -> (i64, i64) {
        let state = self.inner.state.lock();
        (state.collect, state.publish)
    }

    /// Advance the walk one step and return the new value
    pub fn current_value(&self) -> i64 {
        self.inner.state.lock().walk.step(&mut rand::thread_rng())
    }

    /// Start with the configured cadences
    pub fn start_default(&self) -> Lifecycle {
        let (collect, publish) = (self.inner.spec.collection_time, self.inner.spec.publishing_time);
        self.start(collect, publish)
    }

    /// Start (or retune) the flow; a non-positive cadence stops it
    pub fn start(&self, collect: i64, publish: i64) -> Lifecycle {
        if !SensorSpec::valid_cadence(collect, publish) {
            debug!(sensor = %self.id(), collect, publish, "invalid cadence, stopping flow");
            self.stop();
            return Lifecycle::Idle;
        }

        let mut state = self.inner.state.lock();
        state.collect = collect;
        state.publish = publish;
        if state.lifecycle == Lifecycle::Running {
            debug!(sensor = %self.id(), collect, publish, "flow cadence updated");
            return Lifecycle::Running;
        }
        self.spawn_loop(&mut state);
        info!(sensor = %self.id(), kind = %self.inner.spec.kind, collect, publish, "flow started");
        Lifecycle::Running
    }

    /// Paused → Running with the last cadences; no-op otherwise
    pub fn resume(&self) -> Lifecycle {
        let mut state = self.inner.state.lock();
        if state.lifecycle != Lifecycle::Paused {
            return state.lifecycle;
        }
        if !SensorSpec::valid_cadence(state.collect, state.publish) {
            state.lifecycle = Lifecycle::Idle;
            return Lifecycle::Idle;
        }
        self.spawn_loop(&mut state);
        debug!(sensor = %self.id(), "flow resumed");
        Lifecycle::Running
    }

    /// Running → Paused; returns whether the flow was running
    pub fn pause(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.lifecycle != Lifecycle::Running {
            return false;
        }
        Self::cancel_loop(&mut state);
        state.lifecycle = Lifecycle::Paused;
        debug!(sensor = %self.id(), "flow paused");
        true
    }

    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if state.lifecycle == Lifecycle::Idle {
            return;
        }
        Self::cancel_loop(&mut state);
        state.lifecycle = Lifecycle::Idle;
        info!(sensor = %self.id(), "flow stopped");
    }

    fn cancel_loop(state: &mut FlowState) {
        state.generation += 1;
        if let Some(token) = state.cancel.take() {
            token.cancel();
        }
    }

    fn spawn_loop(&self, state: &mut FlowState) {
        Self::cancel_loop(state);
        let token = CancellationToken::new();
        state.cancel = Some(token.clone());
        state.lifecycle = Lifecycle::Running;
        tokio::spawn(run_flow(self.inner.clone(), state.generation, token));
    }
}

async fn run_flow(inner: Arc<RunnerInner>, generation: u64, token: CancellationToken) {
    let mut values = Vec::new();
    let mut elapsed = 0i64;

    loop {
        let (collect, _) = inner.cadence();
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(collect as u64)) => {}
        }
        if token.is_cancelled() {
            return;
        }

        values.push(inner.state.lock().walk.step(&mut rand::thread_rng()));
        elapsed += collect;

        let (collect, publish) = inner.cadence();
        if elapsed < publish {
            continue;
        }

        let batch = std::mem::take(&mut values);
        elapsed = 0;
        if let Err(e) = inner.publish(batch, collect, publish).await {
            error!(sensor = %inner.spec.id, "flow publish failed: {}", e);
            let mut state = inner.state.lock();
            if state.generation == generation {
                state.lifecycle = Lifecycle::Idle;
                state.cancel = None;
            }
            return;
        }
    }
}

impl RunnerInner {
    fn cadence(&self) -> (i64, i64) {
        let state = self.state.lock();
        (state.collect, state.publish)
    }

    async fn publish(&self, values: Vec<i64>, collect: i64, publish: i64) -> Result<()> {
        let connection = self.ctx.slot.current().ok_or(DeviceError::NotConnected)?;
        let device_id = &self.ctx.device_id;
        let payload = codec::flow_response(device_id, &self.spec.id, &values, collect, publish);

        self.ctx
            .tracker
            .publish_and_track(
                connection.as_ref(),
                &codec::response_topic(device_id),
                &self.spec.id,
                payload,
            )
            .await?;

        self.ctx.telemetry.put(SensorReading {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            device_id: device_id.clone(),
            sensor_id: self.spec.id.clone(),
            values,
        });
        Ok(())
    }
}
