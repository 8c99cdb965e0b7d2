//! Bounded batching between producers and a slow sink
//!
//! Producers call `put` from any task and never wait on the sink. A single
//! consumer task accumulates items and hands a full batch to the sink once
//! the threshold is reached. `stop` closes the gate, lets the consumer drain
//! what was already queued and flushes the remainder once.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::SinkError;

/// Destination of a batch
#[async_trait]
pub trait Sink<T>: Send {
    async fn flush(&mut self, batch: &[T]) -> Result<(), SinkError>;
}

pub struct BatchBuffer<T> {
    name: String,
    threshold: usize,
    /// `None` while the gate is closed
    gate: Mutex<Option<mpsc::UnboundedSender<T>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl<T: Send + Sync + 'static> BatchBuffer<T> {
    /// A threshold of 0 behaves like 1
    pub fn new(name: impl Into<String>, threshold: usize) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            gate: Mutex::new(None),
            consumer: Mutex::new(None),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Spawn the consumer and open the gate
    pub fn start<S>(&self, sink: S)
    where
        S: Sink<T> + 'static,
    {
        let mut gate = self.gate.lock();
        if gate.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false) {
            warn!(buffer = %self.name, "buffer already running");
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = tokio::spawn(consume(
            self.name.clone(),
            self.threshold,
            rx,
            sink,
            self.pending.clone(),
        ));
        *gate = Some(tx);
        *self.consumer.lock() = Some(consumer);
        debug!(buffer = %self.name, threshold = self.threshold, "buffer started");
    }

    /// Queue an item; silently dropped while the buffer is not running
    pub fn put(&self, item: T) {
        let gate = self.gate.lock();
        if let Some(tx) = gate.as_ref() {
            self.pending.fetch_add(1, Ordering::SeqCst);
            if tx.send(item).is_err() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Close the gate, flush whatever was queued and wait for the consumer
    pub async fn stop(&self) {
        // dropping the sender lets the consumer see every queued item, then the end
        let sender = self.gate.lock().take();
        drop(sender);

        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.await {
                error!(buffer = %self.name, "buffer consumer panicked: {}", e);
            }
            debug!(buffer = %self.name, "buffer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.gate
            .lock()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Items accepted but not yet flushed
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

async fn consume<T, S>(
    name: String,
    threshold: usize,
    mut rx: mpsc::UnboundedReceiver<T>,
    mut sink: S,
    pending: Arc<AtomicUsize>,
) where
    T: Send + Sync + 'static,
    S: Sink<T>,
{
    let mut batch = Vec::with_capacity(threshold);

    while let Some(item) = rx.recv().await {
        batch.push(item);
        if batch.len() >= threshold {
            if let Err(e) = flush(&name, &mut sink, &mut batch, &pending).await {
                error!(buffer = %name, "sink failed, consumer stops: {}", e);
                return;
            }
        }
    }

    if !batch.is_empty() {
        if let Err(e) = flush(&name, &mut sink, &mut batch, &pending).await {
            error!(buffer = %name, "final flush failed: {}", e);
        }
    }
}

async fn flush<T, S>(name: &str, sink: &mut S, batch: &mut Vec<T>, pending: &AtomicUsize) -> Result<(), SinkError>
where
    T: Send + Sync,
    S: Sink<T>,
{
    let items = std::mem::take(batch);
    debug!(buffer = %name, items = items.len(), "flushing batch");
    pending.fetch_sub(items.len(), Ordering::SeqCst);
    sink.flush(&items).await
}
