use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{MessageId, MessageKind, UserId, SYSTEM_USER_ID};

/// Username attached to synthetic system messages.
pub const SYSTEM_USERNAME: &str = "System";

/// Canonical message shape shared by the timeline, the dedup ledger, and
/// presentation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub kind: MessageKind,
    pub user_id: UserId,
    pub username: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn chat(
        user_id: UserId,
        username: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: MessageKind::Chat,
            user_id,
            username: username.into(),
            content: content.into(),
            timestamp,
        }
    }

    /// System messages always carry the reserved sender identity.
    pub fn system(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: MessageKind::System,
            user_id: SYSTEM_USER_ID,
            username: SYSTEM_USERNAME.to_string(),
            content: content.into(),
            timestamp,
        }
    }
}

/// Raw inbound frame envelope. Payload shapes vary per `kind` (and some
/// servers nest the real fields one level deeper), so the envelope keeps the
/// payload untyped and normalization happens client-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Frames the client is allowed to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    ChatMessage { content: String },
}

/// One record of the history snapshot endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub user_id: UserId,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Body of `GET /api/chat/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub data: Vec<HistoryRecord>,
}
