//! Common types used throughout the bot.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a message in the conversation.
///
/// Maps to OpenRouter API message roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Message from the human user
    User,
    /// Message from the AI assistant
    Assistant,
    /// System prompt or instructions
    System,
}

/// Identity of a conversation the bot may be tracking.
///
/// A conversation is a chat plus an optional thread inside it. Two ids refer
/// to the same conversation only when both parts match exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationId {
    chat_id: u64,
    thread_id: Option<u64>,
}

impl ConversationId {
    #[must_use]
    pub const fn new(chat_id: u64) -> Self {
        Self {
            chat_id,
            thread_id: None,
        }
    }

    #[must_use]
    pub const fn with_thread(self, thread_id: u64) -> Self {
        Self {
            chat_id: self.chat_id,
            thread_id: Some(thread_id),
        }
    }

    /// Channel that outgoing messages for this conversation are posted to.
    #[must_use]
    pub const fn target_channel(&self) -> u64 {
        match self.thread_id {
            Some(thread_id) => thread_id,
            None => self.chat_id,
        }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.thread_id {
            Some(thread_id) => write!(f, "{}/{}", self.chat_id, thread_id),
            None => write!(f, "{}", self.chat_id),
        }
    }
}

/// A message observed in a tracked conversation.
///
/// Immutable once recorded; the content is shared rather than copied when the
/// buffer is snapshotted for a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedMessage {
    sender_id: u64,
    sender_name: String,
    timestamp: DateTime<Utc>,
    content: Arc<str>,
}

impl TrackedMessage {
    /// Record a message received now.
    pub fn new(sender_id: u64, sender_name: impl Into<String>, content: impl Into<Arc<str>>) -> Self {
        Self::at(sender_id, sender_name, content, Utc::now())
    }

    pub fn at(
        sender_id: u64,
        sender_name: impl Into<String>,
        content: impl Into<Arc<str>>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sender_id,
            sender_name: sender_name.into(),
            timestamp,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn sender_id(&self) -> u64 {
        self.sender_id
    }

    #[must_use]
    pub fn sender_name(&self) -> &str {
        &self.sender_name
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_scope_is_part_of_identity() {
        let chat = ConversationId::new(10);
        let thread = chat.with_thread(20);
        assert_ne!(chat, thread);
        assert_eq!(thread, ConversationId::new(10).with_thread(20));
    }

    #[test]
    fn target_channel_prefers_thread() {
        assert_eq!(ConversationId::new(10).target_channel(), 10);
        assert_eq!(ConversationId::new(10).with_thread(20).target_channel(), 20);
    }

    #[test]
    fn display_includes_thread() {
        assert_eq!(ConversationId::new(7).to_string(), "7");
        assert_eq!(ConversationId::new(7).with_thread(8).to_string(), "7/8");
    }
}
