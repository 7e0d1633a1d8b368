use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Who wrote a message. Serialized as `"user"` / `"ai"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
}

impl Sender {
    /// Label used when rendering a transcript line.
    pub fn label(self) -> &'static str {
        match self {
            Sender::User => "User",
            Sender::Ai => "AI",
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub sender: Sender,
    pub text: String,
}

/// Ordered chat history. Insertion order is significant.
pub type Session = Vec<Message>;

impl Message {
    /// Creates a message whose id sorts after every message already in `session`.
    pub fn new(session: &[Message], sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: next_id(session),
            sender,
            text: text.into(),
        }
    }

    pub fn is_user(&self) -> bool {
        self.sender == Sender::User
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Millisecond timestamp, bumped past the newest id in `session` when the clock
/// has not moved on (two messages in one event, or a clock step backwards).
///
/// Saturates at `i64::MAX`; sessions read from storage go through
/// [`rebase_exhausted_ids`] first so that bound is never reached in practice.
pub fn next_id(session: &[Message]) -> i64 {
    let now = now_millis();
    match session.iter().map(|m| m.id).max() {
        Some(last) if last >= now => last.saturating_add(1),
        _ => now,
    }
}

/// Renumbers a session whose ids leave no room for another message
/// (some id is `i64::MAX`). Order is kept; ids become consecutive from now.
pub fn rebase_exhausted_ids(session: &mut Session) {
    if session.iter().all(|m| m.id < i64::MAX) {
        return;
    }
    let len = session.len() as i64;
    let base = now_millis().min(i64::MAX - len - 1);
    for (offset, message) in (0..).zip(session.iter_mut()) {
        message.id = base + offset;
    }
}
