//! Converts heterogeneous inbound wire payloads into canonical messages.

use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::{
    domain::UserId,
    protocol::{ChatMessage, HistoryRecord, WireFrame},
};
use tracing::debug;

use crate::Credentials;

/// Maps an inbound frame to a canonical message, or `None` for frames that
/// carry no message (unknown types, presence without a username, chat frames
/// without content). `online_count` frames never reach this path; the session
/// applies them to the counter directly.
pub(crate) fn normalize_frame(frame: &WireFrame, local: &Credentials) -> Option<ChatMessage> {
    match frame.kind.as_str() {
        "message" | "chat_message" => chat_from_payload(&frame.payload, local),
        "user_joined" => presence(&frame.payload, "joined the chat"),
        "user_left" => presence(&frame.payload, "left the chat"),
        other => {
            debug!(kind = other, "dropping frame of unknown type");
            None
        }
    }
}

/// History records are pre-structured; `created_at` becomes the timestamp.
pub(crate) fn from_history(record: HistoryRecord) -> ChatMessage {
    ChatMessage::chat(
        record.user_id,
        record.username,
        record.content,
        record.created_at,
    )
}

fn chat_from_payload(payload: &Value, local: &Credentials) -> Option<ChatMessage> {
    // Some senders wrap the real fields in a second payload level.
    let fields = match payload.get("payload") {
        Some(inner) if inner.is_object() => inner,
        _ => payload,
    };

    let Some(content) = fields.get("content").and_then(Value::as_str) else {
        debug!("dropping chat frame without content");
        return None;
    };
    let user_id = fields
        .get("user_id")
        .and_then(Value::as_i64)
        .map(UserId)
        .unwrap_or(local.user_id);
    let username = fields
        .get("username")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| local.username.clone());
    let timestamp = fields
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);

    Some(ChatMessage::chat(user_id, username, content, timestamp))
}

fn presence(payload: &Value, action: &str) -> Option<ChatMessage> {
    let username = payload.get("username").and_then(Value::as_str)?;
    Some(ChatMessage::system(
        format!("{username} {action}"),
        Utc::now(),
    ))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
#[path = "tests/normalizer_tests.rs"]
mod tests;
