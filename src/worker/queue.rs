//! Bounded event queue with a fixed worker pool.
//!
//! Ingestion submits events without waiting for them to be processed. A full
//! queue rejects instead of growing, and every event runs in its own task so
//! a panic is caught at its `JoinHandle`, logged and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{Error, QueueError};
use crate::model::NormalizedEvent;
use crate::pipeline::{EventProcessor, ProcessOutcome};

/// Something that processes one event.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle_event(&self, event: NormalizedEvent) -> Result<ProcessOutcome, Error>;
}

#[async_trait]
impl EventHandler for EventProcessor {
    async fn handle_event(&self, event: NormalizedEvent) -> Result<ProcessOutcome, Error> {
        self.handle(event).await
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

/// Point-in-time copy of the queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
}

pub struct EventQueue {
    sender: Mutex<Option<mpsc::Sender<NormalizedEvent>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<QueueCounters>,
    capacity: usize,
}

impl EventQueue {
    /// Spawn `config.workers` workers draining a queue of `config.capacity`.
    pub fn start(handler: Arc<dyn EventHandler>, config: &QueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(QueueCounters::default());

        let workers = (0..config.workers)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&rx),
                    Arc::clone(&handler),
                    Arc::clone(&counters),
                ))
            })
            .collect();

        info!(
            capacity = config.capacity,
            workers = config.workers,
            "Event queue started"
        );
        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            counters,
            capacity: config.capacity,
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<NormalizedEvent>, QueueError> {
        self.sender
            .lock()
            .map_err(|_| QueueError::Closed)?
            .clone()
            .ok_or(QueueError::Closed)
    }

    /// Enqueue, waiting for space. For sources that cannot redeliver a
    /// rejected event, such as a long-poll cursor.
    pub async fn submit(&self, event: NormalizedEvent) -> Result<(), QueueError> {
        let sender = self.sender()?;
        sender.send(event).await.map_err(|_| QueueError::Closed)?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue without waiting. Fails when the queue is full or shut down.
    pub fn try_submit(&self, event: NormalizedEvent) -> Result<(), QueueError> {
        let sender = self.sender()?;

        match sender.try_send(event) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    platform = %event.platform,
                    message_id = %event.message_id,
                    capacity = self.capacity,
                    "Event queue full; rejecting event"
                );
                Err(QueueError::Full {
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed),
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting events, let workers drain what is queued, then wait
    /// for them to exit.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().ok().and_then(|mut s| s.take());
        drop(sender);

        let workers = self
            .workers
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Queue worker exited abnormally");
            }
        }
        info!(stats = ?self.stats(), "Event queue stopped");
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<NormalizedEvent>>>,
    handler: Arc<dyn EventHandler>,
    counters: Arc<QueueCounters>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(event) = next else {
            debug!(worker = id, "Queue closed; worker exiting");
            break;
        };

        let platform = event.platform.clone();
        let message_id = event.message_id.clone();
        let handler = Arc::clone(&handler);
        let task = tokio::spawn(async move { handler.handle_event(event).await });

        match task.await {
            Ok(Ok(outcome)) if outcome.is_failed() => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Ok(_)) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker = id, platform = %platform, message_id = %message_id, error = %e, "Event handling failed");
            }
            Err(e) if e.is_panic() => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                error!(worker = id, platform = %platform, message_id = %message_id, "Event task panicked");
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker = id, error = %e, "Event task cancelled");
            }
        }
    }
}
