//! Broker migration
//!
//! A migration connects to a candidate broker, announces the device on
//! `dev/CONNECTIONS` and waits for the broker's CONNACK on
//! `dev/CONNECTIONS/RES`. The CONNACK path and the timeout watchdog race to
//! resolve the attempt through one compare-and-swap on the migration state,
//! so exactly one of them commits or rolls back.
//!
//! Only one migration runs at a time per device. Flows running when the
//! attempt is admitted are paused and resumed afterwards, whatever the outcome.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{self, ConnectRequest, Method, CONNECTIONS_RESPONSE_TOPIC, CONNECTIONS_TOPIC};
use crate::device::DeviceController;
use crate::error::{DeviceError, TransportError};
use crate::models::BrokerEndpoint;
use crate::net;
use crate::transport::{Connection, EventStream, QoS, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrationState {
    Idle = 0,
    Connecting = 1,
    AwaitingAck = 2,
    Committed = 3,
    RolledBack = 4,
}

impl MigrationState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => MigrationState::Connecting,
            2 => MigrationState::AwaitingAck,
            3 => MigrationState::Committed,
            4 => MigrationState::RolledBack,
            _ => MigrationState::Idle,
        }
    }
}

#[derive(Debug)]
pub enum RollbackReason {
    ConnectFailed(TransportError),
    HandshakeTimeout(Duration),
    HandshakeRejected(BrokerEndpoint),
    ConnectionLost(String),
    Transport(TransportError),
}

impl fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackReason::ConnectFailed(e) => write!(f, "connect failed: {e}"),
            RollbackReason::HandshakeTimeout(t) => write!(f, "no CONNACK within {t:?}"),
            RollbackReason::HandshakeRejected(b) => write!(f, "rejected by {b}"),
            RollbackReason::ConnectionLost(r) => write!(f, "connection lost: {r}"),
            RollbackReason::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl From<RollbackReason> for DeviceError {
    fn from(reason: RollbackReason) -> Self {
        match reason {
            RollbackReason::ConnectFailed(e) | RollbackReason::Transport(e) => DeviceError::Connection(e),
            RollbackReason::HandshakeTimeout(t) => DeviceError::HandshakeTimeout(t),
            RollbackReason::HandshakeRejected(b) => DeviceError::HandshakeRejected(b.uri()),
            RollbackReason::ConnectionLost(_) => DeviceError::Connection(TransportError::Closed),
        }
    }
}

#[derive(Debug)]
pub enum MigrationOutcome {
    /// Another migration was already in progress; nothing was done
    Busy,
    Committed,
    RolledBack(RollbackReason),
}

impl MigrationOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, MigrationOutcome::Committed)
    }
}

pub struct MigrationEngine {
    controller: Arc<DeviceController>,
    state: Arc<AtomicU8>,
    retry_interval: Duration,
}

/// What the CONNACK wait loop settled on
enum Verdict {
    Accepted(EventStream),
    Rejected,
    TimedOut,
    Lost(String),
}

impl MigrationEngine {
    pub fn new(controller: Arc<DeviceController>) -> Self {
        Self {
            controller,
            state: Arc::new(AtomicU8::new(MigrationState::Idle as u8)),
            retry_interval: Duration::from_secs(1),
        }
    }

    /// Pause between connect attempts when retrying
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn state(&self) -> MigrationState {
        MigrationState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_migrating(&self) -> bool {
        self.controller.device().is_migrating()
    }

    fn set_state(&self, state: MigrationState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Move the device to `endpoint`, keeping the current connection on any failure
    pub async fn migrate(&self, endpoint: BrokerEndpoint, timeout: Duration, retry: bool) -> MigrationOutcome {
        let device = self.controller.device().clone();
        if !device.begin_migration() {
            info!(device = %device.id, broker = %endpoint, "migration already in progress, ignoring request");
            return MigrationOutcome::Busy;
        }

        info!(device = %device.id, broker = %endpoint, "starting broker migration");
        let paused = self.controller.pause_all_flows();

        let outcome = self.attempt(&endpoint, timeout, retry).await;
        match &outcome {
            MigrationOutcome::Committed => info!(device = %device.id, broker = %endpoint, "migration committed"),
            MigrationOutcome::RolledBack(reason) => {
                warn!(device = %device.id, broker = %endpoint, "migration rolled back: {}", reason)
            }
            MigrationOutcome::Busy => {}
        }

        device.end_migration();
        self.controller.resume_flows(&paused);
        self.set_state(MigrationState::Idle);
        outcome
    }

    async fn attempt(&self, endpoint: &BrokerEndpoint, timeout: Duration, retry: bool) -> MigrationOutcome {
        self.set_state(MigrationState::Connecting);
        let device_id = self.controller.id().to_string();

        let (candidate, mut events) = loop {
            debug!(device = %device_id, broker = %endpoint, "connecting to candidate broker");
            match self.controller.connector().connect(endpoint, &device_id).await {
                Ok(pair) => break pair,
                Err(e) if retry => {
                    warn!(device = %device_id, broker = %endpoint, "connect failed, retrying: {}", e);
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(e) => return self.roll_back(RollbackReason::ConnectFailed(e)),
            }
        };

        if let Err(e) = candidate.subscribe(CONNECTIONS_RESPONSE_TOPIC, QoS::ExactlyOnce).await {
            close(candidate.as_ref()).await;
            return self.roll_back(RollbackReason::Transport(e));
        }

        let source_ip = net::reachable_ip(endpoint).await;
        self.set_state(MigrationState::AwaitingAck);
        let watchdog = CancellationToken::new();
        let (timeout_tx, mut timeout_rx) = oneshot::channel();
        tokio::spawn(run_watchdog(
            self.state.clone(),
            candidate.clone(),
            timeout,
            watchdog.clone(),
            timeout_tx,
        ));

        let device = self.controller.device();
        let request = ConnectRequest {
            device_id: &device.id,
            latitude: device.latitude,
            longitude: device.longitude,
            sensors: &device.sensors,
            source_ip: Some(source_ip.as_str()),
            timeout,
        }
        .encode();

        if let Err(e) = candidate
            .publish(CONNECTIONS_TOPIC, request.into_bytes(), QoS::AtLeastOnce)
            .await
        {
            if self.resolve(MigrationState::RolledBack) {
                watchdog.cancel();
                close(candidate.as_ref()).await;
                return MigrationOutcome::RolledBack(RollbackReason::Transport(e));
            }
            let _ = timeout_rx.await;
            return MigrationOutcome::RolledBack(RollbackReason::HandshakeTimeout(timeout));
        }

        let verdict = loop {
            tokio::select! {
                biased;
                _ = &mut timeout_rx => break Verdict::TimedOut,
                event = events.recv() => match event {
                    Some(TransportEvent::Message { topic, payload }) if topic == CONNECTIONS_RESPONSE_TOPIC => {
                        let accepted = match parse_connack(&payload) {
                            Some(accepted) => accepted,
                            None => continue,
                        };
                        let target = if accepted { MigrationState::Committed } else { MigrationState::RolledBack };
                        if !self.resolve(target) {
                            // the watchdog already rolled back
                            let _ = (&mut timeout_rx).await;
                            break Verdict::TimedOut;
                        }
                        watchdog.cancel();
                        if accepted {
                            break Verdict::Accepted(events);
                        }
                        break Verdict::Rejected;
                    }
                    Some(TransportEvent::Message { topic, .. }) => {
                        debug!(device = %device_id, %topic, "ignoring message while awaiting CONNACK");
                    }
                    Some(TransportEvent::DeliveryAck(_)) => {}
                    Some(TransportEvent::ConnectionLost(reason)) => {
                        if self.resolve(MigrationState::RolledBack) {
                            watchdog.cancel();
                            break Verdict::Lost(reason);
                        }
                    }
                    None => {
                        if self.resolve(MigrationState::RolledBack) {
                            watchdog.cancel();
                            break Verdict::Lost("event stream closed".into());
                        }
                        let _ = (&mut timeout_rx).await;
                        break Verdict::TimedOut;
                    }
                }
            }
        };

        match verdict {
            Verdict::Accepted(events) => self.commit(candidate, events).await,
            Verdict::Rejected => {
                close(candidate.as_ref()).await;
                MigrationOutcome::RolledBack(RollbackReason::HandshakeRejected(endpoint.clone()))
            }
            Verdict::TimedOut => MigrationOutcome::RolledBack(RollbackReason::HandshakeTimeout(timeout)),
            Verdict::Lost(reason) => {
                close(candidate.as_ref()).await;
                MigrationOutcome::RolledBack(RollbackReason::ConnectionLost(reason))
            }
        }
    }

    async fn commit(&self, candidate: Arc<dyn Connection>, events: EventStream) -> MigrationOutcome {
        if let Err(e) = self.controller.adopt(candidate.clone(), events).await {
            self.set_state(MigrationState::RolledBack);
            close(candidate.as_ref()).await;
            let reason = match e {
                DeviceError::Connection(e) => RollbackReason::Transport(e),
                other => RollbackReason::ConnectionLost(other.to_string()),
            };
            return MigrationOutcome::RolledBack(reason);
        }
        if let Err(e) = candidate.unsubscribe(CONNECTIONS_RESPONSE_TOPIC).await {
            warn!(device = %self.controller.id(), "failed to leave {}: {}", CONNECTIONS_RESPONSE_TOPIC, e);
        }
        MigrationOutcome::Committed
    }

    fn roll_back(&self, reason: RollbackReason) -> MigrationOutcome {
        self.set_state(MigrationState::RolledBack);
        MigrationOutcome::RolledBack(reason)
    }

    /// Settle an AwaitingAck attempt; false when the other side got there first
    fn resolve(&self, target: MigrationState) -> bool {
        self.state
            .compare_exchange(
                MigrationState::AwaitingAck as u8,
                target as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

fn parse_connack(payload: &[u8]) -> Option<bool> {
    let message = match codec::decode(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("undecodable payload on {}: {}", CONNECTIONS_RESPONSE_TOPIC, e);
            return None;
        }
    };
    if !message.is_response() || message.method != Method::Connack {
        warn!(method = %message.method, "unexpected message on {}", CONNECTIONS_RESPONSE_TOPIC);
        return None;
    }
    match message.connack_accepted() {
        Ok(accepted) => {
            debug!(from = message.response_name().unwrap_or_default(), accepted, "CONNACK received");
            Some(accepted)
        }
        Err(e) => {
            warn!("malformed CONNACK: {}", e);
            None
        }
    }
}

async fn run_watchdog(
    state: Arc<AtomicU8>,
    candidate: Arc<dyn Connection>,
    timeout: Duration,
    cancel: CancellationToken,
    fired: oneshot::Sender<()>,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(timeout) => {
            let won = state
                .compare_exchange(
                    MigrationState::AwaitingAck as u8,
                    MigrationState::RolledBack as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok();
            if won {
                warn!(broker = %candidate.endpoint(), "no CONNACK within {:?}, dropping candidate", timeout);
                close(candidate.as_ref()).await;
                let _ = fired.send(());
            }
        }
    }
}

async fn close(connection: &dyn Connection) {
    if let Err(e) = connection.disconnect().await {
        error!(broker = %connection.endpoint(), "failed to disconnect candidate: {}", e);
    }
}
