use crate::topic::TopicClass;
use chrono::{DateTime, Local, Utc};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::fmt;

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Canonical metrics, superset across firmware generations.
///
/// Declaration order is the column order of the CSV output. Only append new
/// variants at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    Voltage,
    CurrentSigned,
    Current,
    PowerSigned,
    Power,
    Direction,
    Ip,
    Soc,
    Soh,
    UptimeMs,
    UptimeS,
    ShuntMv,
    ErrorCount,
}

impl Field {
    pub const ALL: [Field; 13] = [
        Field::Voltage,
        Field::CurrentSigned,
        Field::Current,
        Field::PowerSigned,
        Field::Power,
        Field::Direction,
        Field::Ip,
        Field::Soc,
        Field::Soh,
        Field::UptimeMs,
        Field::UptimeS,
        Field::ShuntMv,
        Field::ErrorCount,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::Voltage => "voltage",
            Field::CurrentSigned => "current_signed",
            Field::Current => "current",
            Field::PowerSigned => "power_signed",
            Field::Power => "power",
            Field::Direction => "direction",
            Field::Ip => "ip",
            Field::Soc => "soc",
            Field::Soh => "soh",
            Field::UptimeMs => "uptime_ms",
            Field::UptimeS => "uptime_s",
            Field::ShuntMv => "shunt_mv",
            Field::ErrorCount => "error_count",
        }
    }

    /// Payload keys accepted for this field, highest priority first. Every key
    /// in a list must already be in the field's unit.
    pub fn source_keys(self) -> &'static [&'static str] {
        match self {
            Field::Voltage => &["bus_V", "voltage"],
            Field::CurrentSigned => &["current_signed"],
            Field::Current => &["current_A", "current"],
            Field::PowerSigned => &["power_signed"],
            Field::Power => &["power_W", "power"],
            Field::Direction => &["direction"],
            Field::Ip => &["ip"],
            Field::Soc => &["soc_percent", "soc"],
            Field::Soh => &["soh_percent", "soh"],
            Field::UptimeMs => &["uptime_ms"],
            // the smart-plug firmware reports `uptime` in seconds
            Field::UptimeS => &["uptime"],
            Field::ShuntMv => &["shunt_mV"],
            Field::ErrorCount => &["errorCount"],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(Number),
    Text(String),
    Bool(bool),
}

impl FieldValue {
    /// `None` for JSON null. Objects and arrays are kept as compact JSON text.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Number(number) => Some(FieldValue::Number(number.clone())),
            Value::String(text) => Some(FieldValue::Text(text.clone())),
            Value::Bool(flag) => Some(FieldValue::Bool(*flag)),
            other => Some(FieldValue::Text(other.to_string())),
        }
    }

    #[cfg(test)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(number) => number.as_f64(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Number(number) => Value::Number(number.clone()),
            FieldValue::Text(text) => Value::String(text.clone()),
            FieldValue::Bool(flag) => Value::Bool(*flag),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(number) => write!(f, "{number}"),
            FieldValue::Text(text) => f.write_str(text),
            FieldValue::Bool(flag) => write!(f, "{flag}"),
        }
    }
}

/// One normalized inbound message. Built once, then only read by sinks.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub received_at_ms: i64,
    pub received_at_iso: String,
    pub topic: String,
    pub device_type: String,
    pub device_id: String,
    pub fields: BTreeMap<Field, FieldValue>,
    pub raw_payload: String,
}

impl Reading {
    pub fn new(
        received_at: DateTime<Utc>,
        topic: String,
        class: TopicClass,
        fields: BTreeMap<Field, FieldValue>,
        raw_payload: String,
    ) -> Self {
        Self {
            received_at_ms: received_at.timestamp_millis(),
            received_at_iso: local_iso(received_at),
            topic,
            device_type: class.device_type,
            device_id: class.device_id,
            fields,
            raw_payload,
        }
    }

    pub fn field(&self, field: Field) -> Option<&FieldValue> {
        self.fields.get(&field)
    }
}

pub fn local_iso(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format(ISO_FORMAT).to_string()
}
