//! Chat transcript records.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::protocol::Sources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Session-unique message identifier, also used as the socket `message_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        MessageId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId(s.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Sources>,
    /// The content is still being revealed or received.
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub is_error: bool,
}

impl Message {
    fn new(role: Role, content: String) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content,
            timestamp_ms: now_ms(),
            sources: None,
            is_streaming: false,
            is_error: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into())
    }

    /// Empty assistant bubble that will be filled by a streamed answer.
    pub fn assistant_placeholder() -> Self {
        let mut msg = Self::new(Role::Assistant, String::new());
        msg.is_streaming = true;
        msg
    }

    pub fn error(content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Assistant, content.into());
        msg.is_error = true;
        msg
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn has_sources(&self) -> bool {
        self.sources.as_ref().is_some_and(|s| !s.is_empty())
    }
}

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let ids: std::collections::HashSet<MessageId> = (0..200).map(|_| MessageId::new()).collect();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn placeholder_is_streaming_and_empty() {
        let m = Message::assistant_placeholder();
        assert_eq!(m.role, Role::Assistant);
        assert!(m.is_streaming);
        assert!(m.content.is_empty());
        assert!(!m.is_error);
    }

    #[test]
    fn error_message_is_flagged() {
        let m = Message::error("⚠️ nope");
        assert!(m.is_error);
        assert!(!m.is_streaming);
    }

    #[test]
    fn now_ms_plausible_epoch() {
        assert!(now_ms() > 1_700_000_000_000);
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(Role::User.to_string(), "user");
    }

    #[test]
    fn message_id_is_transparent_in_json() {
        let m = Message::user("hi").with_id(MessageId::from("abc"));
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["id"], "abc");
        assert!(v.get("sources").is_none());
    }
}
