use super::{Sink, SinkError};
use crate::reading::{Field, Reading};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

const REST_PREFIX: &str = "rest/v1";

#[derive(Serialize)]
struct RemoteRow<'a> {
    ts: i64,
    ts_iso: &'a str,
    topic: &'a str,
    device_type: &'a str,
    device_id: &'a str,
    #[serde(flatten)]
    fields: BTreeMap<&'static str, Option<Value>>,
    raw_payload: &'a str,
}

impl<'a> RemoteRow<'a> {
    fn from_reading(reading: &'a Reading) -> Self {
        let fields = Field::ALL
            .iter()
            .map(|field| (field.name(), reading.field(*field).map(|v| v.to_json())))
            .collect();
        Self {
            ts: reading.received_at_ms,
            ts_iso: &reading.received_at_iso,
            topic: &reading.topic,
            device_type: &reading.device_type,
            device_id: &reading.device_id,
            fields,
            raw_payload: &reading.raw_payload,
        }
    }
}

fn reading_payload(reading: &Reading) -> Vec<RemoteRow<'_>> {
    vec![RemoteRow::from_reading(reading)]
}

/// Inserts rows into a PostgREST-style table. Meant to run behind a
/// [`super::QueuedSink`]; a slow endpoint would otherwise stall the receive
/// loop.
pub struct RemoteSink {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl RemoteSink {
    pub fn new(
        base_url: &str,
        table: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(timeout).build()?;
        let endpoint = format!(
            "{}/{}/{}",
            base_url.trim_end_matches('/'),
            REST_PREFIX,
            table.trim_matches('/')
        );
        Ok(Self {
            client,
            endpoint,
            api_key: api_key.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Sink for RemoteSink {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn append(&self, reading: &Reading) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "return=minimal")
            .json(&reading_payload(reading))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
