
use crate::normalize::normalize;
use crate::reading::Reading;
use crate::sink::Sink;
use crate::topic::classify;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A publish as handed over by the MQTT loop, stamped on receipt.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
impl InboundMessage {
    pub fn now(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub messages_received: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub readings_dispatched: AtomicU64,
    pub sink_failures: AtomicU64,
    pub mqtt_connected: AtomicBool,
}

impl PipelineStats {
    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn log_summary(&self) {
        tracing::info!(
            received = self.messages_received.load(Ordering::Relaxed),
            dropped = self.messages_dropped.load(Ordering::Relaxed),
            dispatched = self.readings_dispatched.load(Ordering::Relaxed),
            sink_failures = self.sink_failures.load(Ordering::Relaxed),
            mqtt_connected = self.mqtt_connected.load(Ordering::Relaxed),
            "pipeline summary"
        );
    }
}

/// Classify, normalize, then hand the reading to every sink in order.
///
/// Nothing in here propagates an error to the caller: a bad message is
/// dropped and a failing sink is logged while the remaining sinks still
/// receive the reading.
#[derive(Clone)]
pub struct Pipeline {
    sinks: Arc<Vec<Arc<dyn Sink>>>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self {
            sinks: Arc::new(sinks),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    pub async fn process(&self, message: InboundMessage) -> Option<Reading> {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        let class = classify(&message.topic);
        if !class.is_classified() {
            tracing::debug!(topic=%message.topic, "topic matched no device pattern");
        }

        let reading = match normalize(&message.topic, class, &message.payload, message.received_at) {
            Ok(reading) => reading,
            Err(err) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error=%err, topic=%message.topic, "dropping undecodable message");
                return None;
            }
        };

        self.dispatch(&reading).await;
        Some(reading)
    }

    async fn dispatch(&self, reading: &Reading) {
        for sink in self.sinks.iter() {
            if let Err(err) = sink.append(reading).await {
                self.stats.sink_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    sink = sink.name(),
                    topic = %reading.topic,
                    ts = reading.received_at_ms,
                    error=%err,
                    "sink append failed"
                );
            }
        }
        self.stats.readings_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            topic = %reading.topic,
            device_type = %reading.device_type,
            device_id = %reading.device_id,
            fields = reading.fields.len(),
            "dispatched reading"
        );
    }

    /// Closes every sink concurrently; each close is bounded by the sink
    /// itself.
    pub async fn close(&self) {
        let results =
            futures::future::join_all(self.sinks.iter().map(|sink| async move {
                (sink.name(), sink.close().await)
            }))
            .await;
        for (name, result) in results {
            match result {
                Ok(()) => tracing::debug!(sink = name, "sink closed"),
                Err(err) => tracing::warn!(sink = name, error=%err, "sink close failed"),
            }
        }
    }
}
