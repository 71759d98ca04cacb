use crate::reading::{Field, FieldValue, Reading};
use crate::topic::TopicClass;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// Builds the canonical [`Reading`] for one message body.
///
/// Only an undecodable body is an error. Anything that is not a JSON object
/// yields a reading with every field empty and the text kept verbatim in
/// `raw_payload`.
pub fn normalize(
    topic: &str,
    class: TopicClass,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<Reading, NormalizeError> {
    let text = std::str::from_utf8(payload)?;

    let mut fields = BTreeMap::new();
    if let Some(source) = parse_field_source(text) {
        for field in Field::ALL {
            if let Some(value) = resolve_field(&source, field) {
                fields.insert(field, value);
            }
        }
    }

    Ok(Reading::new(
        received_at,
        topic.to_string(),
        class,
        fields,
        text.to_string(),
    ))
}

fn parse_field_source(text: &str) -> Option<Map<String, Value>> {
    let first = text.trim_start().as_bytes().first().copied();
    if first != Some(b'{') {
        return None;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(obj)) => Some(obj),
        Ok(_) => None,
        Err(err) => {
            tracing::trace!(error=%err, "payload is not JSON; keeping raw text only");
            None
        }
    }
}

/// First present, non-null source key wins. `0`, `false` and `""` count as
/// present.
fn resolve_field(source: &Map<String, Value>, field: Field) -> Option<FieldValue> {
    field
        .source_keys()
        .iter()
        .find_map(|key| source.get(*key).and_then(FieldValue::from_json))
}
