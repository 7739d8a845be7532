//! Folding committed events into snapshot state.

use crate::error::{HubError, Result};
use crate::types::{EventLogEntry, PayloadEncoding};

/// Apply one committed event to a JSON-array state.
///
/// JSON payloads are embedded as values; other encodings are hex-encoded.
pub fn apply_event(state: Vec<u8>, entry: &EventLogEntry) -> Result<Vec<u8>> {
    let mut arr: Vec<serde_json::Value> = if state.is_empty() {
        Vec::new()
    } else {
        serde_json::from_slice(&state).map_err(|e| HubError::Deserialization(e.to_string()))?
    };

    arr.push(event_value(entry)?);

    serde_json::to_vec(&arr).map_err(|e| HubError::Serialization(e.to_string()))
}

/// Apply a batch of committed events, in order.
pub fn fold_entries(state: Vec<u8>, entries: &[EventLogEntry]) -> Result<Vec<u8>> {
    if entries.is_empty() {
        if state.is_empty() {
            return Ok(b"[]".to_vec());
        }
        return Ok(state);
    }

    let mut arr: Vec<serde_json::Value> = if state.is_empty() {
        Vec::new()
    } else {
        serde_json::from_slice(&state).map_err(|e| HubError::Deserialization(e.to_string()))?
    };

    arr.reserve(entries.len());
    for entry in entries {
        arr.push(event_value(entry)?);
    }

    serde_json::to_vec(&arr).map_err(|e| HubError::Serialization(e.to_string()))
}

fn event_value(entry: &EventLogEntry) -> Result<serde_json::Value> {
    let event = &entry.event;

    let data = match event.encoding {
        PayloadEncoding::Json => serde_json::from_slice(&event.payload)
            .map_err(|e| HubError::Deserialization(e.to_string()))?,
        PayloadEncoding::MessagePack | PayloadEncoding::Raw => {
            serde_json::Value::String(hex::encode(&event.payload))
        }
    };

    Ok(serde_json::json!({
        "event_id": event.event_id.as_str(),
        "sequence": entry.sequence.0,
        "timestamp": event.timestamp.0,
        "kind": event.kind,
        "data": data,
    }))
}
