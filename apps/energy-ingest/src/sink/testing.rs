use super::{Sink, SinkError};
use crate::reading::Reading;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

/// Keeps every reading it is handed.
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub(crate) name: &'static str,
    pub(crate) readings: Mutex<Vec<Reading>>,
}

impl RecordingSink {
    pub(crate) fn named(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            readings: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        self.readings
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.topic.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.readings.lock().unwrap().len()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn append(&self, reading: &Reading) -> Result<(), SinkError> {
        self.readings.lock().unwrap().push(reading.clone());
        Ok(())
    }
}

/// Fails the first `failures` appends, then records.
pub(crate) struct FlakySink {
    pub(crate) failures: u32,
    pub(crate) attempts: AtomicU32,
    pub(crate) inner: Arc<RecordingSink>,
}

impl FlakySink {
    pub(crate) fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            attempts: AtomicU32::new(0),
            inner: RecordingSink::named("flaky"),
        })
    }
}

#[async_trait]
impl Sink for FlakySink {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn append(&self, reading: &Reading) -> Result<(), SinkError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(SinkError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        self.inner.append(reading).await
    }
}

/// Always fails, like a document store that lost its connection.
pub(crate) struct FailingSink;

#[async_trait]
impl Sink for FailingSink {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn append(&self, _reading: &Reading) -> Result<(), SinkError> {
        Err(SinkError::Io(std::io::Error::other("insert failed")))
    }
}

/// Blocks every append until a permit is released, then records.
pub(crate) struct GatedSink {
    pub(crate) gate: Semaphore,
    pub(crate) entered: Notify,
    pub(crate) inner: Arc<RecordingSink>,
}

impl GatedSink {
    pub(crate) fn closed() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            entered: Notify::new(),
            inner: RecordingSink::named("gated"),
        })
    }

    pub(crate) fn open_gate(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl Sink for GatedSink {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn append(&self, reading: &Reading) -> Result<(), SinkError> {
        self.entered.notify_one();
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|err| SinkError::Worker(err.to_string()))?;
        permit.forget();
        self.inner.append(reading).await
    }
}
