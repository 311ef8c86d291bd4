//! Store-completion events and the relay envelopes they travel in.
//!
//! A relay message body is a JSON document with a `Records` array. Each record
//! is either a store event (`{"s3": {...}}`) or another envelope whose
//! `Sns.Message` field holds a nested document as a string. Unwrapping turns a
//! body into a flat list of independent [`WorkItem`]s; a malformed record only
//! poisons its own item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

pub const OBJECT_CREATED_PUT: &str = "ObjectCreated:Put";

/// Envelopes nested deeper than this are rejected instead of recursed into.
pub const MAX_ENVELOPE_DEPTH: usize = 8;

/// A completed write of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreEvent {
    pub event_name: String,
    pub event_time: DateTime<Utc>,
    pub bucket: String,
    pub key: String,
    pub size: u64,
}

impl StoreEvent {
    pub fn object_created(bucket: impl Into<String>, key: impl Into<String>, size: u64) -> Self {
        Self {
            event_name: OBJECT_CREATED_PUT.to_string(),
            event_time: Utc::now(),
            bucket: bucket.into(),
            key: key.into(),
            size,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("document has no Records array")]
    MissingRecords,
    #[error("record is neither a store event nor an envelope")]
    UnrecognizedRecord,
    #[error("store event record is malformed: {0}")]
    InvalidStoreRecord(String),
    #[error("envelopes nested deeper than {0} levels")]
    TooDeep(usize),
}

/// One unit of work extracted from a relay message. `position` locates the
/// record inside the nesting, e.g. `0.2` is the third store record of the
/// first envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub position: String,
    pub event: Result<StoreEvent, EnvelopeError>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreRecordWire {
    #[serde(default = "default_event_name")]
    event_name: String,
    #[serde(default = "Utc::now")]
    event_time: DateTime<Utc>,
    s3: StoreEntityWire,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreEntityWire {
    bucket: BucketWire,
    object: ObjectWire,
}

#[derive(Debug, Serialize, Deserialize)]
struct BucketWire {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ObjectWire {
    key: String,
    #[serde(default)]
    size: u64,
}

fn default_event_name() -> String {
    OBJECT_CREATED_PUT.to_string()
}

/// Renders store events as a notification document.
pub fn store_notification(events: &[StoreEvent]) -> Value {
    let records: Vec<Value> = events
        .iter()
        .map(|event| {
            json!({
                "eventName": event.event_name,
                "eventTime": event.event_time,
                "s3": {
                    "bucket": { "name": event.bucket },
                    "object": { "key": event.key, "size": event.size },
                },
            })
        })
        .collect();
    json!({ "Records": records })
}

/// Wraps a document in one envelope level, the way the relay topic forwards it.
pub fn wrap_in_envelope(inner: &Value) -> Value {
    json!({
        "Records": [{
            "Sns": {
                "MessageId": Uuid::new_v4(),
                "Message": inner.to_string(),
            }
        }]
    })
}

/// Flattens a relay message body into independent work items.
pub fn unwrap_work_items(body: &str) -> Vec<WorkItem> {
    let mut items = Vec::new();
    match serde_json::from_str::<Value>(body) {
        Ok(document) => collect(&document, "", 0, &mut items),
        Err(err) => items.push(WorkItem {
            position: "0".to_string(),
            event: Err(EnvelopeError::InvalidJson(err.to_string())),
        }),
    }
    items
}

fn collect(document: &Value, prefix: &str, depth: usize, items: &mut Vec<WorkItem>) {
    let position_of = |index: usize| {
        if prefix.is_empty() {
            index.to_string()
        } else {
            format!("{prefix}.{index}")
        }
    };

    if depth > MAX_ENVELOPE_DEPTH {
        items.push(WorkItem {
            position: position_of(0),
            event: Err(EnvelopeError::TooDeep(MAX_ENVELOPE_DEPTH)),
        });
        return;
    }

    let Some(records) = document.get("Records").and_then(Value::as_array) else {
        items.push(WorkItem {
            position: position_of(0),
            event: Err(EnvelopeError::MissingRecords),
        });
        return;
    };

    for (index, record) in records.iter().enumerate() {
        let position = position_of(index);

        if let Some(envelope) = record.get("Sns") {
            match envelope.get("Message").and_then(Value::as_str) {
                Some(message) => match serde_json::from_str::<Value>(message) {
                    Ok(nested) => collect(&nested, &position, depth + 1, items),
                    Err(err) => items.push(WorkItem {
                        position,
                        event: Err(EnvelopeError::InvalidJson(err.to_string())),
                    }),
                },
                None => items.push(WorkItem {
                    position,
                    event: Err(EnvelopeError::UnrecognizedRecord),
                }),
            }
        } else if record.get("s3").is_some() {
            let event = serde_json::from_value::<StoreRecordWire>(record.clone())
                .map(|wire| StoreEvent {
                    event_name: wire.event_name,
                    event_time: wire.event_time,
                    bucket: wire.s3.bucket.name,
                    key: wire.s3.object.key,
                    size: wire.s3.object.size,
                })
                .map_err(|err| EnvelopeError::InvalidStoreRecord(err.to_string()));
            items.push(WorkItem { position, event });
        } else {
            items.push(WorkItem {
                position,
                event: Err(EnvelopeError::UnrecognizedRecord),
            });
        }
    }
}
