use std::collections::HashSet;

use chrono::{DateTime, Utc};
use shared::{domain::UserId, protocol::ChatMessage};

/// Identity of a message for duplicate detection.
///
/// The transport guarantees no server-assigned message id, so identity is
/// derived from sender, content, and timestamp. Two users sending
/// byte-identical content at the same instant collapse into one entry; an
/// accepted tradeoff.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DedupKey {
    user_id: UserId,
    content: String,
    timestamp: DateTime<Utc>,
}

impl DedupKey {
    pub(crate) fn new(user_id: UserId, content: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            user_id,
            content: content.to_string(),
            timestamp,
        }
    }

    pub(crate) fn of(message: &ChatMessage) -> Self {
        Self::new(message.user_id, &message.content, message.timestamp)
    }
}

/// Sole gate for timeline appends: tracks admitted keys and locally-sent
/// messages awaiting their server echo.
#[derive(Debug, Default)]
pub(crate) struct DedupLedger {
    seen: HashSet<DedupKey>,
    pending_echo: HashSet<DedupKey>,
    timeline: Vec<ChatMessage>,
}

impl DedupLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Admits a message to the timeline unless it duplicates an earlier one
    /// or is the echo of a message this client already accounted for.
    /// Returns whether the timeline grew.
    pub(crate) fn admit(&mut self, message: ChatMessage) -> bool {
        let key = DedupKey::of(&message);
        if self.pending_echo.remove(&key) {
            // Echo of an optimistically tracked local send. Record the key so
            // later replays of the same event stay suppressed too.
            self.seen.insert(key);
            return false;
        }
        if !self.seen.insert(key) {
            return false;
        }
        self.timeline.push(message);
        true
    }

    /// Records a locally-sent message whose server echo should be recognized.
    pub(crate) fn mark_pending_echo(&mut self, key: DedupKey) {
        self.pending_echo.insert(key);
    }

    pub(crate) fn unmark_pending_echo(&mut self, key: &DedupKey) {
        self.pending_echo.remove(key);
    }

    /// Clears timeline, ledger, and pending-echo set in one step. Callers
    /// hold the session state lock, so no admit can interleave.
    pub(crate) fn reset(&mut self) {
        self.seen.clear();
        self.pending_echo.clear();
        self.timeline.clear();
    }

    pub(crate) fn timeline(&self) -> &[ChatMessage] {
        &self.timeline
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &DedupKey) -> bool {
        self.seen.contains(key)
    }

    #[cfg(test)]
    pub(crate) fn pending_echo_count(&self) -> usize {
        self.pending_echo.len()
    }
}

#[cfg(test)]
#[path = "tests/ledger_tests.rs"]
mod tests;
