//! Canonicalization of loosely-shaped remote payloads.
//!
//! The realtime channel delivers fields as either structured objects or
//! JSON-encoded strings depending on the server code path. Everything is
//! normalized into the canonical [`MessageRecord`] shape here, at the
//! collaborator boundary, so shape ambiguity never reaches the reconciler.

use serde_json::Value;
use thiserror::Error;

use crate::types::{Attachment, DeliveryState, MessageKind, MessageRecord, ReplySnapshot};

/// Errors produced while normalizing a remote payload.
///
/// A failed normalization drops the event; the store is left unchanged and
/// the caller logs the anomaly as non-fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    /// A required identifier field is missing or empty.
    #[error("payload is missing required field '{0}'")]
    MissingField(&'static str),
    /// The message kind string is not recognized.
    #[error("unknown message kind '{0}'")]
    UnknownKind(String),
    /// The timestamp field is absent or not a number.
    #[error("invalid createdAt timestamp")]
    InvalidTimestamp,
    /// A structured field could not be parsed in either shape
    /// (object/array or JSON-encoded string).
    #[error("unparseable field '{field}': {reason}")]
    Malformed { field: &'static str, reason: String },
}

impl NormalizeError {
    fn malformed(field: &'static str, err: impl ToString) -> Self {
        NormalizeError::Malformed {
            field,
            reason: err.to_string(),
        }
    }
}

/// Normalize one `onNewMessage` payload into a canonical [`MessageRecord`].
pub fn normalize_message(payload: &Value) -> Result<MessageRecord, NormalizeError> {
    let id = required_str(payload, "id")?;
    let conversation_id = required_str(payload, "conversationId")?;
    let sender_id = required_str(payload, "senderId")?;

    let kind = parse_kind(payload.get("kind"))?;
    let created_at_ms = parse_timestamp(payload.get("createdAt"))?;
    let attachments = parse_attachments(payload)?;

    let content = payload
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    let reply_snapshot = match payload.get("replySnapshot").filter(|value| !value.is_null()) {
        Some(value) => Some(
            serde_json::from_value::<ReplySnapshot>(resolve_json_string(value))
                .map_err(|err| NormalizeError::malformed("replySnapshot", err))?,
        ),
        None => None,
    };

    Ok(MessageRecord {
        id,
        provisional_id: optional_str(payload, "provisionalId"),
        conversation_id,
        sender_id,
        content,
        kind,
        attachments,
        created_at_ms,
        seq: 0,
        delivery_state: DeliveryState::Sent,
        recalled: payload
            .get("recalled")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        pinned: payload
            .get("pinned")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        hidden_from: Default::default(),
        delivered_to: Default::default(),
        read_by: Default::default(),
        reply_to_id: optional_str(payload, "replyToId"),
        reply_snapshot,
    })
}

/// Extract the message-id batch of a delivery/read receipt payload.
///
/// Accepts both a JSON array and a JSON-encoded string of ids.
pub fn normalize_receipt_ids(payload: &Value) -> Result<Vec<String>, NormalizeError> {
    let value = payload
        .get("messageIds")
        .ok_or(NormalizeError::MissingField("messageIds"))?;
    let resolved = resolve_json_string(value);
    serde_json::from_value(resolved).map_err(|err| NormalizeError::malformed("messageIds", err))
}

fn required_str(payload: &Value, field: &'static str) -> Result<String, NormalizeError> {
    optional_str(payload, field).ok_or(NormalizeError::MissingField(field))
}

fn optional_str(payload: &Value, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn parse_kind(value: Option<&Value>) -> Result<MessageKind, NormalizeError> {
    let Some(value) = value else {
        // Bare payloads without a kind are plain text messages.
        return Ok(MessageKind::Text);
    };
    serde_json::from_value(value.clone())
        .map_err(|_| NormalizeError::UnknownKind(value.to_string()))
}

fn parse_timestamp(value: Option<&Value>) -> Result<u64, NormalizeError> {
    let value = value.ok_or(NormalizeError::InvalidTimestamp)?;
    match value {
        Value::Number(number) => number.as_u64().ok_or(NormalizeError::InvalidTimestamp),
        // Some code paths stringify the epoch timestamp.
        Value::String(text) => text.parse().map_err(|_| NormalizeError::InvalidTimestamp),
        _ => Err(NormalizeError::InvalidTimestamp),
    }
}

fn parse_attachments(payload: &Value) -> Result<Vec<Attachment>, NormalizeError> {
    if let Some(value) = payload.get("attachments").filter(|v| !v.is_null()) {
        let resolved = resolve_json_string(value);
        return serde_json::from_value(resolved)
            .map_err(|err| NormalizeError::malformed("attachments", err));
    }

    // Legacy singular field; normalized to attachments[0].
    if let Some(value) = payload.get("attachment").filter(|v| !v.is_null()) {
        let resolved = resolve_json_string(value);
        let attachment: Attachment = serde_json::from_value(resolved)
            .map_err(|err| NormalizeError::malformed("attachment", err))?;
        return Ok(vec![attachment]);
    }

    Ok(Vec::new())
}

/// Unwrap one level of JSON-encoded-string indirection when present.
fn resolve_json_string(value: &Value) -> Value {
    if let Value::String(text) = value
        && let Ok(parsed) = serde_json::from_str::<Value>(text)
        && (parsed.is_object() || parsed.is_array())
    {
        return parsed;
    }
    value.clone()
}
