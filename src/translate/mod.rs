//! Value-change to MQTT message translation
//!
//! `translate` is pure: the same event and spec always produce the same topic
//! and the same payload bytes. Events that cannot be represented produce
//! `Translation::Untranslatable` instead of an error so the session can count
//! and drop them.
//!
//! Payload document:
//!
//! ```json
//! {
//!   "transferId": "tp-1",
//!   "assetId": "asset-42",
//!   "nodeId": "ns=2;s=Temperature",
//!   "type": "float",
//!   "value": 21.5,
//!   "quality": "Good",
//!   "statusCode": 0,
//!   "timestamp": "2024-05-01T12:00:00Z",
//!   "serverTimestamp": "2024-05-01T12:00:00.012Z"
//! }
//! ```
//!
//! Bytes are standard base64 strings. Non-finite floats are the strings
//! `"NaN"`, `"Infinity"` and `"-Infinity"`. Structured values are objects
//! whose fields are themselves `{ "type": ..., "value": ... }` pairs.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as Json};

use crate::config::TransferSpec;
use crate::protocol::QoS;
use crate::source::NodeId;
use crate::topic::TopicContext;
use crate::value::{Quality, QualityLevel, Value, ValueChangeEvent};


/// A message ready for the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Outcome of translating one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Translation {
    Message(SinkMessage),
    /// The event has no valid message form; carries the reason
    Untranslatable { node_id: NodeId, reason: String },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    transfer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    asset_id: Option<String>,
    node_id: String,
    #[serde(rename = "type")]
    value_type: String,
    value: Json,
    quality: String,
    status_code: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server_timestamp: Option<String>,
}

/// Map one value change onto its destination topic and payload
pub fn translate(event: &ValueChangeEvent, spec: &TransferSpec) -> Translation {
    let untranslatable = |reason: String| Translation::Untranslatable {
        node_id: event.node_id.clone(),
        reason,
    };

    let node = event.node_id.to_string();
    let topic = match spec.sink.topic.render(&TopicContext {
        node: &node,
        transfer: &spec.id,
        asset: spec.asset_id.as_deref(),
    }) {
        Ok(topic) => topic,
        Err(reason) => return untranslatable(format!("topic: {}", reason)),
    };

    let value = match encode_value(&event.value) {
        Ok(value) => value,
        Err(reason) => return untranslatable(reason),
    };

    let document = Document {
        transfer_id: spec.id.clone(),
        asset_id: spec.asset_id.clone(),
        node_id: node,
        value_type: event.value.type_name().to_string(),
        value,
        quality: event.quality.level.as_str().to_string(),
        status_code: event.quality.code,
        reason: event.quality.reason.clone(),
        timestamp: event.source_timestamp.as_ref().map(format_timestamp),
        server_timestamp: event.server_timestamp.as_ref().map(format_timestamp),
    };

    match serde_json::to_vec(&document) {
        Ok(payload) => Translation::Message(SinkMessage {
            topic,
            payload: Bytes::from(payload),
            qos: spec.sink.qos,
            retain: spec.sink.retain,
        }),
        Err(e) => untranslatable(format!("serialization failed: {}", e)),
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn encode_value(value: &Value) -> Result<Json, String> {
    Ok(match value {
        Value::Boolean(b) => Json::Bool(*b),
        Value::Integer(i) => Json::Number((*i).into()),
        Value::Float(f) => match Number::from_f64(*f) {
            Some(number) => Json::Number(number),
            None if f.is_nan() => Json::String("NaN".to_string()),
            None if *f > 0.0 => Json::String("Infinity".to_string()),
            None => Json::String("-Infinity".to_string()),
        },
        Value::String(s) => Json::String(s.clone()),
        Value::Bytes(b) => Json::String(BASE64.encode(b)),
        Value::Structured(fields) => {
            let mut object = Map::with_capacity(fields.len());
            for (name, field) in fields {
                let encoded = encode_value(field).map_err(|e| format!("field '{}': {}", name, e))?;
                let mut entry = Map::with_capacity(2);
                entry.insert("type".to_string(), Json::String(field.type_name().to_string()));
                entry.insert("value".to_string(), encoded);
                object.insert(name.clone(), Json::Object(entry));
            }
            Json::Object(object)
        }
        Value::Unsupported { type_name, detail } => {
            return Err(format!("unsupported value type {}: {}", type_name, detail));
        }
    })
}

/// Error reading a payload document back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadError(pub String);

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid payload: {}", self.0)
    }
}

impl std::error::Error for PayloadError {}

/// Decode a payload document back into the event it was produced from
///
/// Used by consumers and tests; the bridge itself only writes documents.
pub fn parse_payload(payload: &[u8]) -> Result<ValueChangeEvent, PayloadError> {
    let document: Document =
        serde_json::from_slice(payload).map_err(|e| PayloadError(e.to_string()))?;

    let node_id = document
        .node_id
        .parse::<NodeId>()
        .map_err(|e| PayloadError(e.to_string()))?;
    let value = decode_value(&document.value_type, &document.value)?;

    let level = match document.quality.as_str() {
        "Good" => QualityLevel::Good,
        "Uncertain" => QualityLevel::Uncertain,
        "Bad" => QualityLevel::Bad,
        other => return Err(PayloadError(format!("unknown quality {:?}", other))),
    };

    Ok(ValueChangeEvent {
        node_id,
        value,
        source_timestamp: document.timestamp.as_deref().map(parse_timestamp).transpose()?,
        server_timestamp: document
            .server_timestamp
            .as_deref()
            .map(parse_timestamp)
            .transpose()?,
        quality: Quality {
            level,
            code: document.status_code,
            reason: document.reason,
        },
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, PayloadError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| PayloadError(format!("timestamp {:?}: {}", raw, e)))
}

fn decode_value(type_name: &str, raw: &Json) -> Result<Value, PayloadError> {
    let mismatch = || PayloadError(format!("value does not match type {}", type_name));
    Ok(match type_name {
        "boolean" => Value::Boolean(raw.as_bool().ok_or_else(mismatch)?),
        "integer" => Value::Integer(raw.as_i64().ok_or_else(mismatch)?),
        "float" => Value::Float(match raw {
            Json::String(s) if s == "NaN" => f64::NAN,
            Json::String(s) if s == "Infinity" => f64::INFINITY,
            Json::String(s) if s == "-Infinity" => f64::NEG_INFINITY,
            _ => raw.as_f64().ok_or_else(mismatch)?,
        }),
        "string" => Value::String(raw.as_str().ok_or_else(mismatch)?.to_string()),
        "bytes" => Value::Bytes(
            BASE64
                .decode(raw.as_str().ok_or_else(mismatch)?)
                .map_err(|e| PayloadError(e.to_string()))?,
        ),
        "structured" => {
            let object = raw.as_object().ok_or_else(mismatch)?;
            let mut fields = BTreeMap::new();
            for (name, entry) in object {
                let field_type = entry
                    .get("type")
                    .and_then(Json::as_str)
                    .ok_or_else(|| PayloadError(format!("field '{}' has no type", name)))?;
                let field_value = entry
                    .get("value")
                    .ok_or_else(|| PayloadError(format!("field '{}' has no value", name)))?;
                fields.insert(name.clone(), decode_value(field_type, field_value)?);
            }
            Value::Structured(fields)
        }
        other => return Err(PayloadError(format!("unknown value type {:?}", other))),
    })
}
