//! Bounded, arrival-ordered record of messages seen in a tracked conversation.

use std::sync::Arc;

use crate::types::TrackedMessage;

/// Messages observed since the current tracking window opened.
///
/// The capacity equals the session's message budget; the budget trigger is
/// what keeps the buffer from ever growing past it, so there is no eviction.
#[derive(Debug, Clone, Default)]
pub struct ConversationBuffer {
    messages: Vec<TrackedMessage>,
    capacity: Option<usize>,
}

impl ConversationBuffer {
    /// A capacity of zero means unbounded.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: Vec::with_capacity(capacity),
            capacity: (capacity > 0).then_some(capacity),
        }
    }

    /// Append a message, handing it back if the buffer is already full.
    pub fn push(&mut self, message: TrackedMessage) -> Result<(), TrackedMessage> {
        if self.is_full() {
            return Err(message);
        }
        self.messages.push(message);
        Ok(())
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.capacity.is_some_and(|cap| self.messages.len() >= cap)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedMessage> {
        self.messages.iter()
    }

    /// Read-only copy of the buffered messages, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Arc<[TrackedMessage]> {
        Arc::from(self.messages.as_slice())
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
