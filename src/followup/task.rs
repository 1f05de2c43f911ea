//! The task that owns one follow-up session.
//!
//! Every event for a conversation goes through this task's inbox, so state
//! transitions for one conversation never overlap while separate
//! conversations run side by side.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::error::{BotError, Result};
use crate::types::TrackedMessage;

use super::gateway::{DecisionGateway, DecisionRequest, DecisionVerdict};
use super::session::{FollowUpSession, SessionState, TerminationReason, Transition};
use super::transport::Transport;

/// Deadline used while a session has no timer armed.
const IDLE_SLEEP: Duration = Duration::from_secs(60 * 60 * 24 * 365);

#[derive(Debug)]
pub(super) enum Command {
    Deliver(TrackedMessage),
    Cancel(TerminationReason),
}

enum Event {
    Command(Option<Command>),
    Deadline,
    Verdict(Result<DecisionVerdict>),
}

pub(super) struct SessionTask {
    pub(super) session: FollowUpSession,
    pub(super) commands: mpsc::UnboundedReceiver<Command>,
    pub(super) state: watch::Sender<SessionState>,
    pub(super) gateway: Arc<dyn DecisionGateway>,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) judgment_timeout: Duration,
}

impl SessionTask {
    /// Drive the session until it terminates.
    ///
    /// The loop itself never awaits I/O: decisions and sends run on their own
    /// tasks, so a cancel command is always picked up promptly.
    pub(super) async fn run(mut self) -> TerminationReason {
        let mut armed = self.session.deadline();
        let sleep = sleep_until(armed.unwrap_or_else(|| Instant::now() + IDLE_SLEEP));
        tokio::pin!(sleep);
        let mut pending: Option<JoinHandle<Result<DecisionVerdict>>> = None;

        let reason = loop {
            let timer_armed = armed.is_some();
            let event = tokio::select! {
                command = self.commands.recv() => Event::Command(command),
                () = &mut sleep, if timer_armed => Event::Deadline,
                outcome = await_verdict(&mut pending) => Event::Verdict(outcome),
            };

            let transition = match event {
                Event::Command(Some(Command::Deliver(message))) => {
                    self.session.record(message, Instant::now())
                }
                Event::Command(Some(Command::Cancel(reason))) => self.session.cancel(reason),
                Event::Command(None) => self.session.cancel(TerminationReason::Cancelled),
                Event::Deadline => self.session.expire(),
                Event::Verdict(outcome) => self.session.resolve(outcome, Instant::now()),
            };

            match transition {
                Transition::Stay => {}
                Transition::Decide(request) => pending = Some(self.spawn_decision(request)),
                Transition::FollowUp { content, decide } => {
                    match content {
                        Some(content) => self.spawn_send(content),
                        None => debug!(
                            "Continuing {} without a follow-up message",
                            self.session.conversation_id()
                        ),
                    }
                    if let Some(request) = decide {
                        pending = Some(self.spawn_decision(request));
                    }
                }
                Transition::Terminate(reason) => break reason,
            }

            self.state.send_replace(self.session.state());

            let deadline = self.session.deadline();
            if deadline != armed {
                if let Some(at) = deadline {
                    sleep.as_mut().reset(at);
                }
                armed = deadline;
            }
        };

        // A decision still in flight finishes on its own; nobody reads it.
        drop(pending);
        self.state.send_replace(SessionState::Terminated);
        reason
    }

    fn spawn_decision(&self, request: DecisionRequest) -> JoinHandle<Result<DecisionVerdict>> {
        let gateway = Arc::clone(&self.gateway);
        let limit = self.judgment_timeout;
        tokio::spawn(async move {
            let outcome = if limit.is_zero() {
                gateway.decide(&request).await
            } else {
                match tokio::time::timeout(limit, gateway.decide(&request)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(BotError::JudgmentUnavailable(format!(
                        "no verdict within {}s",
                        limit.as_secs()
                    ))),
                }
            };
            match &outcome {
                Ok(verdict) => info!(
                    "Verdict for {}: continue={}",
                    request.conversation_id, verdict.should_continue
                ),
                Err(e) => warn!("Judgment for {} failed: {e}", request.conversation_id),
            }
            outcome
        })
    }

    fn spawn_send(&self, content: String) {
        let transport = Arc::clone(&self.transport);
        let conversation_id = self.session.conversation_id();
        tokio::spawn(async move {
            if let Err(e) = transport.send(conversation_id, content).await {
                warn!("Failed to send follow-up to {conversation_id}: {e}");
            }
        });
    }
}

async fn await_verdict(
    pending: &mut Option<JoinHandle<Result<DecisionVerdict>>>,
) -> Result<DecisionVerdict> {
    let Some(handle) = pending.as_mut() else {
        return std::future::pending().await;
    };
    let joined = handle.await;
    *pending = None;
    joined.unwrap_or_else(|e| {
        Err(BotError::JudgmentUnavailable(format!(
            "judgment task failed: {e}"
        )))
    })
}
