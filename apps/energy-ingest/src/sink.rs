mod document;
mod queued;
mod remote;
mod tabular;

#[cfg(test)]
pub(crate) mod testing;

pub use document::DocumentSink;
pub use queued::{QueueConfig, QueuedSink};
pub use remote::RemoteSink;
pub use tabular::TabularSink;

use crate::reading::Reading;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("document store error: {0}")]
    Document(#[from] mongodb::error::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("queue full; newest reading dropped")]
    QueueFull,
    #[error("queue closed")]
    QueueClosed,
    #[error("drain timed out with {pending} readings undelivered")]
    DrainTimeout { pending: usize },
    #[error("sink worker failed: {0}")]
    Worker(String),
    #[error("sink lock poisoned")]
    Poisoned,
}

/// A destination for readings. Implementations own their target (file,
/// collection, endpoint) and hold it open until [`Sink::close`].
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn append(&self, reading: &Reading) -> Result<(), SinkError>;

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
