use super::{Sink, SinkError};
use crate::reading::Reading;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub drain_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
pub struct QueueStats {
    pub enqueued: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped_full: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTotals {
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped_full: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn totals(&self) -> QueueTotals {
        QueueTotals {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Runs a slow sink off the receive path.
///
/// `append` only enqueues; a single worker task delivers to the inner sink
/// with bounded retries. A full queue rejects the newest reading instead of
/// waiting.
pub struct QueuedSink {
    name: &'static str,
    tx: mpsc::Sender<Reading>,
    stats: Arc<QueueStats>,
    drain_timeout: Duration,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedSink {
    /// `cancel` is the process-wide token; the worker also stops when this
    /// sink is closed on its own.
    pub fn spawn(inner: Arc<dyn Sink>, config: QueueConfig, cancel: &CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let stats = Arc::new(QueueStats::default());
        let cancel = cancel.child_token();
        let name = inner.name();
        let drain_timeout = config.drain_timeout;

        let worker = tokio::spawn(run_worker(inner, rx, stats.clone(), config, cancel.clone()));

        Self {
            name,
            tx,
            stats,
            drain_timeout,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    #[cfg(test)]
    pub(crate) fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }

    fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    fn log_totals(&self) -> QueueTotals {
        let totals = self.stats.totals();
        tracing::info!(
            sink = self.name,
            enqueued = totals.enqueued,
            delivered = totals.delivered,
            dropped_full = totals.dropped_full,
            failed = totals.failed,
            "queue summary"
        );
        totals
    }
}

#[async_trait]
impl Sink for QueuedSink {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn append(&self, reading: &Reading) -> Result<(), SinkError> {
        match self.tx.try_send(reading.clone()) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.stats.dropped_full.fetch_add(1, Ordering::Relaxed);
                Err(SinkError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(SinkError::QueueClosed),
        }
    }

    /// Stops intake, lets the worker drain, and gives up after the drain
    /// timeout.
    async fn close(&self) -> Result<(), SinkError> {
        self.cancel.cancel();
        let handle = self.worker.lock().map_err(|_| SinkError::Poisoned)?.take();
        let Some(mut handle) = handle else {
            return Ok(());
        };

        let result = match tokio::time::timeout(self.drain_timeout, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(SinkError::Worker(err.to_string())),
            Err(_) => {
                handle.abort();
                let pending = self.pending();
                tracing::warn!(sink = self.name, pending, "queue drain timed out");
                Err(SinkError::DrainTimeout { pending })
            }
        };
        self.log_totals();
        result
    }
}

async fn run_worker(
    inner: Arc<dyn Sink>,
    mut rx: mpsc::Receiver<Reading>,
    stats: Arc<QueueStats>,
    config: QueueConfig,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = rx.recv() => {
                match msg {
                    Some(reading) => deliver(inner.as_ref(), &reading, &config, &stats).await,
                    None => break,
                }
            }
        }
    }

    rx.close();
    let mut drained = 0u64;
    while let Some(reading) = rx.recv().await {
        deliver(inner.as_ref(), &reading, &config, &stats).await;
        drained += 1;
    }
    tracing::debug!(sink = inner.name(), drained, "queue drained");

    if let Err(err) = inner.close().await {
        tracing::warn!(sink = inner.name(), error=%err, "failed to close queued sink");
    }
}

async fn deliver(inner: &dyn Sink, reading: &Reading, config: &QueueConfig, stats: &QueueStats) {
    let attempts = config.max_attempts.max(1);
    let mut backoff = config.retry_backoff;
    for attempt in 1..=attempts {
        match inner.append(reading).await {
            Ok(()) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(err) if attempt < attempts => {
                tracing::debug!(
                    sink = inner.name(),
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error=%err,
                    "delivery failed; retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(err) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    sink = inner.name(),
                    topic = %reading.topic,
                    ts = reading.received_at_ms,
                    attempts,
                    error=%err,
                    "dropping reading after failed delivery"
                );
            }
        }
    }
}
