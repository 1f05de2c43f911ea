//! Per-conversation follow-up state machine.
//!
//! The session itself does no I/O. It is fed events (messages, deadline
//! expiry, verdicts, cancellation) and answers with the [`Transition`] its
//! driver has to carry out.

use std::collections::VecDeque;

use log::{debug, info};
use strum::Display;
use tokio::time::Instant;

use crate::config::FollowUpSettings;
use crate::error::Result;
use crate::types::{ConversationId, TrackedMessage};

use super::buffer::ConversationBuffer;
use super::gateway::{DecisionRequest, DecisionVerdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Active,
    AwaitingDecision,
    Terminated,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TerminationReason {
    /// The deadline passed.
    Timeout,
    /// The judgment service said not to continue.
    Declined,
    /// The judgment service failed or returned something unusable.
    JudgmentUnavailable(String),
    Cancelled,
    ConversationClosed,
    Shutdown,
}

/// What the driver must do after feeding the session an event.
#[derive(Debug)]
pub enum Transition {
    Stay,
    /// Ask the judgment service; the session is now awaiting its verdict.
    Decide(DecisionRequest),
    /// Post `content` (if any) and optionally start another decision right
    /// away when replayed messages used up the fresh budget.
    FollowUp {
        content: Option<String>,
        decide: Option<DecisionRequest>,
    },
    Terminate(TerminationReason),
}

#[derive(Debug)]
pub struct FollowUpSession {
    conversation_id: ConversationId,
    settings: FollowUpSettings,
    buffer: ConversationBuffer,
    queued: VecDeque<TrackedMessage>,
    deadline_at: Option<Instant>,
    budget_remaining: usize,
    state: SessionState,
    expired: bool,
}

impl FollowUpSession {
    #[must_use]
    pub fn new(conversation_id: ConversationId, settings: FollowUpSettings, now: Instant) -> Self {
        let deadline_at = (!settings.timeout.is_zero()).then(|| now + settings.timeout);
        Self {
            conversation_id,
            buffer: ConversationBuffer::with_capacity(settings.max_messages),
            queued: VecDeque::new(),
            deadline_at,
            budget_remaining: settings.max_messages,
            state: SessionState::Active,
            expired: false,
            settings,
        }
    }

    #[must_use]
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Instant at which the driver should call [`Self::expire`], if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            SessionState::Terminated => None,
            _ if self.expired => None,
            _ => self.deadline_at,
        }
    }

    #[must_use]
    pub fn budget_remaining(&self) -> usize {
        self.budget_remaining
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    fn counts_messages(&self) -> bool {
        self.settings.max_messages > 0
    }

    fn past_deadline(&self, now: Instant) -> bool {
        self.deadline_at.is_some_and(|deadline| now >= deadline)
    }

    /// Record a message that arrived at `now`.
    ///
    /// A message arriving at or after the deadline never reaches the buffer:
    /// the session expires first, even if the timer has not fired yet.
    pub fn record(&mut self, message: TrackedMessage, now: Instant) -> Transition {
        if self.state != SessionState::Terminated && !self.expired && self.past_deadline(now) {
            let transition = self.expire();
            if self.state == SessionState::Terminated {
                return transition;
            }
        }
        match self.state {
            SessionState::Terminated => Transition::Stay,
            SessionState::AwaitingDecision => {
                self.queued.push_back(message);
                Transition::Stay
            }
            SessionState::Active => {
                if let Err(message) = self.buffer.push(message) {
                    // Only reachable if the budget and the buffer disagree.
                    self.queued.push_back(message);
                    return self.request_decision();
                }
                if !self.counts_messages() {
                    return Transition::Stay;
                }
                self.budget_remaining = self.budget_remaining.saturating_sub(1);
                if self.budget_remaining == 0 {
                    self.request_decision()
                } else {
                    Transition::Stay
                }
            }
        }
    }

    fn request_decision(&mut self) -> Transition {
        self.state = SessionState::AwaitingDecision;
        debug!(
            "Follow-up for {} requests a decision over {} messages",
            self.conversation_id,
            self.buffer.len()
        );
        Transition::Decide(DecisionRequest {
            conversation_id: self.conversation_id,
            context: self.buffer.snapshot(),
            prompt: self.settings.prompt.clone(),
            model: self.settings.model.clone(),
        })
    }

    /// The deadline passed.
    ///
    /// An active session ends immediately without a decision. A session that is
    /// waiting on a verdict is marked expired and ends once the verdict lands.
    pub fn expire(&mut self) -> Transition {
        match self.state {
            SessionState::Active => self.terminate(TerminationReason::Timeout),
            SessionState::AwaitingDecision => {
                debug!(
                    "Follow-up for {} expired while awaiting a decision",
                    self.conversation_id
                );
                self.expired = true;
                Transition::Stay
            }
            SessionState::Terminated => Transition::Stay,
        }
    }

    /// Apply the outcome of the decision call started by the last
    /// [`Transition::Decide`].
    pub fn resolve(&mut self, outcome: Result<DecisionVerdict>, now: Instant) -> Transition {
        if self.state != SessionState::AwaitingDecision {
            debug!(
                "Discarding verdict for {} in state {}",
                self.conversation_id, self.state
            );
            return Transition::Stay;
        }

        if !self.expired && self.past_deadline(now) {
            self.expire();
        }
        if self.expired {
            info!(
                "Late verdict for {} ignored (continue={:?})",
                self.conversation_id,
                outcome.as_ref().map(|v| v.should_continue).ok()
            );
            return self.terminate(TerminationReason::Timeout);
        }

        let verdict = match outcome {
            Ok(verdict) => verdict,
            Err(e) => return self.terminate(TerminationReason::JudgmentUnavailable(e.to_string())),
        };
        if !verdict.should_continue {
            return self.terminate(TerminationReason::Declined);
        }

        self.state = SessionState::Active;
        self.buffer.clear();
        self.budget_remaining = self.settings.max_messages;
        if !self.settings.timeout.is_zero() {
            self.deadline_at = Some(now + self.settings.timeout);
        }

        let mut decide = None;
        while let Some(message) = self.queued.pop_front() {
            if let Transition::Decide(request) = self.record(message, now) {
                decide = Some(request);
                break;
            }
        }

        Transition::FollowUp {
            content: verdict.content,
            decide,
        }
    }

    /// Stop the session from outside.
    pub fn cancel(&mut self, reason: TerminationReason) -> Transition {
        if self.state == SessionState::Terminated {
            return Transition::Stay;
        }
        self.terminate(reason)
    }

    fn terminate(&mut self, reason: TerminationReason) -> Transition {
        self.state = SessionState::Terminated;
        self.buffer.clear();
        self.queued.clear();
        self.deadline_at = None;
        Transition::Terminate(reason)
    }
}
