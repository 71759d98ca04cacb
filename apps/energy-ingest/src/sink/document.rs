use super::{Sink, SinkError};
use crate::reading::{Field, FieldValue, Reading};
use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use std::time::Duration;

const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(5);
const APP_NAME: &str = "energy-ingest";

pub struct DocumentSink {
    client: Client,
    collection: Collection<Document>,
}

impl DocumentSink {
    /// Connects and pings the database. A failed ping is returned so startup
    /// can abort before subscribing.
    pub async fn connect(uri: &str, database: &str, collection: &str) -> Result<Self, SinkError> {
        let mut options = ClientOptions::parse(uri).await?;
        options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);
        options.app_name = Some(APP_NAME.to_string());
        let client = Client::with_options(options)?;

        let db = client.database(database);
        db.run_command(doc! { "ping": 1 }).await?;
        tracing::info!(database, collection, "connected to document store");

        Ok(Self {
            collection: db.collection::<Document>(collection),
            client,
        })
    }
}

pub fn reading_document(reading: &Reading) -> Document {
    let mut document = doc! {
        "ts": reading.received_at_ms,
        "ts_iso": reading.received_at_iso.as_str(),
        "received_at": reading.received_at_iso.as_str(),
        "topic": reading.topic.as_str(),
        "device_type": reading.device_type.as_str(),
        "device_id": reading.device_id.as_str(),
    };
    for field in Field::ALL {
        let value = reading.field(field).map(field_bson).unwrap_or(Bson::Null);
        document.insert(field.name(), value);
    }
    document.insert("raw_payload", reading.raw_payload.as_str());
    document
}

fn field_bson(value: &FieldValue) -> Bson {
    match value {
        FieldValue::Number(number) => {
            if let Some(int) = number.as_i64() {
                Bson::Int64(int)
            } else if let Some(float) = number.as_f64() {
                Bson::Double(float)
            } else {
                Bson::String(number.to_string())
            }
        }
        FieldValue::Text(text) => Bson::String(text.clone()),
        FieldValue::Bool(flag) => Bson::Boolean(*flag),
    }
}

#[async_trait]
impl Sink for DocumentSink {
    fn name(&self) -> &'static str {
        "mongo"
    }

    async fn append(&self, reading: &Reading) -> Result<(), SinkError> {
        self.collection.insert_one(reading_document(reading)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::topic::classify;
    use chrono::{TimeZone, Utc};

    fn document(topic: &str, payload: &str) -> Document {
        let at = Utc.timestamp_millis_opt(1_760_000_000_000).unwrap();
        let reading = normalize(topic, classify(topic), payload.as_bytes(), at).unwrap();
        reading_document(&reading)
    }

    #[test]
    fn document_is_flat_with_every_field() {
        let doc = document(
            "energy/battery/abc123/telemetry",
            r#"{"voltage": 12.41, "errorCount": 0, "direction": "charging"}"#,
        );
        assert_eq!(doc.get_i64("ts").unwrap(), 1_760_000_000_000);
        assert_eq!(doc.get_str("device_type").unwrap(), "battery");
        assert_eq!(doc.get_str("device_id").unwrap(), "abc123");
        assert_eq!(doc.get_str("ts_iso").unwrap(), doc.get_str("received_at").unwrap());
        assert_eq!(doc.get_f64("voltage").unwrap(), 12.41);
        assert_eq!(doc.get_i64("error_count").unwrap(), 0);
        assert_eq!(doc.get_str("direction").unwrap(), "charging");
        for field in Field::ALL {
            assert!(doc.contains_key(field.name()), "{}", field.name());
        }
        assert_eq!(doc.get("power"), Some(&Bson::Null));
        assert!(doc.values().all(|v| !matches!(v, Bson::Document(_))));
    }

    #[test]
    fn legacy_document_keeps_raw_text() {
        let doc = document("battery/data", "not json");
        assert_eq!(doc.get_str("device_type").unwrap(), "esp32");
        assert_eq!(doc.get_str("device_id").unwrap(), "esp32_1");
        assert_eq!(doc.get_str("raw_payload").unwrap(), "not json");
        assert_eq!(doc.get("voltage"), Some(&Bson::Null));
    }

    #[test]
    fn numbers_map_to_bson_numbers() {
        let big = serde_json::Number::from(u64::MAX);
        assert_eq!(field_bson(&FieldValue::Number(big)), Bson::Double(u64::MAX as f64));
        assert_eq!(
            field_bson(&FieldValue::Number(serde_json::Number::from(-3))),
            Bson::Int64(-3)
        );
        assert_eq!(field_bson(&FieldValue::Bool(true)), Bson::Boolean(true));
    }
}
