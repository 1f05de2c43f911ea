//! Process-wide index of live follow-up sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;

use crate::config::FollowUpSettings;
use crate::types::{ConversationId, TrackedMessage};

use super::gateway::DecisionGateway;
use super::session::{FollowUpSession, SessionState, TerminationReason};
use super::task::{Command, SessionTask};
use super::transport::Transport;

/// Result of [`TrackerRegistry::start_tracking`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A session was already live; it is left untouched.
    AlreadyTracking(SessionState),
    Disabled,
}

/// Emitted once for every session that ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    pub conversation_id: ConversationId,
    pub reason: TerminationReason,
    pub at: DateTime<Utc>,
}

struct SessionHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    fn is_live(&self) -> bool {
        *self.state.borrow() != SessionState::Terminated && !self.commands.is_closed()
    }

    async fn stop(mut self, reason: TerminationReason) {
        let _ = self.commands.send(Command::Cancel(reason));
        // Errors only if the task is already gone.
        let _ = self
            .state
            .wait_for(|state| *state == SessionState::Terminated)
            .await;
    }
}

struct Inner {
    sessions: Mutex<HashMap<ConversationId, SessionHandle>>,
    gateway: Arc<dyn DecisionGateway>,
    transport: Arc<dyn Transport>,
    reports: Option<mpsc::UnboundedSender<TerminationReport>>,
    next_generation: AtomicU64,
}

/// Owns every live follow-up session, at most one per conversation.
///
/// The map lock is only held for lookups, inserts and removals; sessions run
/// on their own tasks, so a slow judgment in one conversation never holds up
/// another.
#[derive(Clone)]
pub struct TrackerRegistry {
    inner: Arc<Inner>,
}

impl TrackerRegistry {
    pub fn new(gateway: Arc<dyn DecisionGateway>, transport: Arc<dyn Transport>) -> Self {
        Self::build(gateway, transport, None)
    }

    /// Like [`Self::new`], also returning a stream of termination reports.
    pub fn with_reports(
        gateway: Arc<dyn DecisionGateway>,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<TerminationReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::build(gateway, transport, Some(tx)), rx)
    }

    fn build(
        gateway: Arc<dyn DecisionGateway>,
        transport: Arc<dyn Transport>,
        reports: Option<mpsc::UnboundedSender<TerminationReport>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                gateway,
                transport,
                reports,
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start following up on a conversation the bot just replied in.
    ///
    /// The settings are copied into the new session. If a session is already
    /// live for this conversation it keeps running unchanged.
    pub async fn start_tracking(
        &self,
        conversation_id: ConversationId,
        settings: &FollowUpSettings,
    ) -> StartOutcome {
        if !settings.is_enabled() {
            debug!("Follow-up tracking disabled, not tracking {conversation_id}");
            return StartOutcome::Disabled;
        }

        let mut sessions = self.inner.sessions.lock().await;
        if let Some(existing) = sessions.get(&conversation_id)
            && existing.is_live()
        {
            let state = *existing.state.borrow();
            debug!("Already tracking {conversation_id} ({state})");
            return StartOutcome::AlreadyTracking(state);
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Active);
        let task = SessionTask {
            session: FollowUpSession::new(conversation_id, settings.clone(), Instant::now()),
            commands: commands_rx,
            state: state_tx,
            gateway: Arc::clone(&self.inner.gateway),
            transport: Arc::clone(&self.inner.transport),
            judgment_timeout: settings.judgment_timeout,
        };

        // Replaces a handle whose task has finished but not been reaped yet.
        sessions.insert(
            conversation_id,
            SessionHandle {
                generation,
                commands: commands_tx,
                state: state_rx,
            },
        );
        tokio::spawn(supervise(
            Arc::clone(&self.inner),
            conversation_id,
            generation,
            task,
        ));

        info!(
            "Started tracking {conversation_id} (timeout {}s, max {} messages)",
            settings.timeout.as_secs(),
            settings.max_messages
        );
        StartOutcome::Started
    }

    /// Route an incoming message to the conversation's session.
    ///
    /// Returns `false` without doing anything when the conversation is not
    /// tracked.
    pub async fn on_incoming_message(
        &self,
        conversation_id: ConversationId,
        message: TrackedMessage,
    ) -> bool {
        let sessions = self.inner.sessions.lock().await;
        let Some(handle) = sessions.get(&conversation_id) else {
            return false;
        };
        debug!(
            "Routing message from {} to follow-up session {conversation_id}",
            message.sender_name()
        );
        handle.commands.send(Command::Deliver(message)).is_ok()
    }

    /// Stop tracking a conversation. Safe to call for untracked conversations.
    ///
    /// Returns once the session has stopped, so a session started afterwards
    /// for the same conversation never overlaps with it.
    pub async fn terminate(&self, conversation_id: ConversationId, reason: TerminationReason) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        let Some(handle) = sessions.remove(&conversation_id) else {
            debug!("No follow-up session to terminate for {conversation_id}");
            return false;
        };
        debug!("Terminating follow-up session {conversation_id} ({reason})");
        // Session tasks never wait on I/O, so holding the map here is brief.
        handle.stop(reason).await;
        true
    }

    /// Current state of the conversation's session, if one is live.
    pub async fn state(&self, conversation_id: ConversationId) -> Option<SessionState> {
        let sessions = self.inner.sessions.lock().await;
        sessions
            .get(&conversation_id)
            .map(|handle| *handle.state.borrow())
            .filter(|state| *state != SessionState::Terminated)
    }

    pub async fn active_sessions(&self) -> usize {
        let sessions = self.inner.sessions.lock().await;
        sessions.values().filter(|handle| handle.is_live()).count()
    }

    /// Terminate every session.
    pub async fn shutdown(&self) {
        let mut sessions = self.inner.sessions.lock().await;
        let count = sessions.len();
        join_all(
            sessions
                .drain()
                .map(|(_, handle)| handle.stop(TerminationReason::Shutdown)),
        )
        .await;
        info!("Follow-up tracker shut down, {count} sessions stopped");
    }
}

async fn supervise(
    inner: Arc<Inner>,
    conversation_id: ConversationId,
    generation: u64,
    task: SessionTask,
) {
    let reason = task.run().await;

    {
        let mut sessions = inner.sessions.lock().await;
        if sessions
            .get(&conversation_id)
            .is_some_and(|handle| handle.generation == generation)
        {
            sessions.remove(&conversation_id);
        }
    }

    info!("Stopped tracking {conversation_id}: {reason}");
    if let Some(reports) = &inner.reports {
        let _ = reports.send(TerminationReport {
            conversation_id,
            reason,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::{BotError, Result};
    use crate::followup::gateway::{DecisionRequest, DecisionVerdict};

    type TestResult = std::result::Result<(), &'static str>;

    struct ScriptedGateway {
        verdicts: std::sync::Mutex<VecDeque<Result<DecisionVerdict>>>,
        delay: Duration,
        requests: mpsc::UnboundedSender<DecisionRequest>,
    }

    #[async_trait]
    impl DecisionGateway for ScriptedGateway {
        async fn decide(&self, request: &DecisionRequest) -> Result<DecisionVerdict> {
            let _ = self.requests.send(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self
                .verdicts
                .lock()
                .map_err(|_| BotError::JudgmentUnavailable("script poisoned".to_string()))?
                .pop_front();
            next.unwrap_or_else(|| Ok(DecisionVerdict::stop()))
        }
    }

    struct RecordingTransport {
        sent: mpsc::UnboundedSender<(ConversationId, String)>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, conversation_id: ConversationId, content: String) -> Result<()> {
            let _ = self.sent.send((conversation_id, content));
            Ok(())
        }
    }

    struct Harness {
        registry: TrackerRegistry,
        reports: mpsc::UnboundedReceiver<TerminationReport>,
        requests: mpsc::UnboundedReceiver<DecisionRequest>,
        sent: mpsc::UnboundedReceiver<(ConversationId, String)>,
    }

    fn harness(verdicts: Vec<Result<DecisionVerdict>>, delay: Duration) -> Harness {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (sent_tx, sent) = mpsc::unbounded_channel();
        let gateway = ScriptedGateway {
            verdicts: std::sync::Mutex::new(verdicts.into()),
            delay,
            requests: requests_tx,
        };
        let transport = RecordingTransport { sent: sent_tx };
        let (registry, reports) =
            TrackerRegistry::with_reports(Arc::new(gateway), Arc::new(transport));
        Harness {
            registry,
            reports,
            requests,
            sent,
        }
    }

    fn settings(timeout_secs: u64, max_messages: usize) -> FollowUpSettings {
        FollowUpSettings {
            enabled: true,
            timeout: Duration::from_secs(timeout_secs),
            max_messages,
            prompt: "Reply?\n{context}".to_string(),
            model: "judge/model".to_string(),
            judgment_timeout: Duration::ZERO,
        }
    }

    fn message(n: u64) -> TrackedMessage {
        TrackedMessage::new(n, format!("user{n}"), format!("message {n}"))
    }

    fn within_a_second_of(elapsed: Duration, secs: u64) -> bool {
        elapsed >= Duration::from_secs(secs) && elapsed < Duration::from_secs(secs + 1)
    }

    #[tokio::test(start_paused = true)]
    async fn continue_verdict_sends_and_resets_window() -> TestResult {
        let mut h = harness(
            vec![
                Ok(DecisionVerdict::proceed(Some("ok, anything else?".to_string()))),
                Ok(DecisionVerdict::stop()),
            ],
            Duration::ZERO,
        );
        let id = ConversationId::new(1);
        let started = h.registry.start_tracking(id, &settings(30, 3)).await;
        assert_eq!(started, StartOutcome::Started);

        for n in 1..=2 {
            assert!(h.registry.on_incoming_message(id, message(n)).await);
            tokio::time::advance(Duration::from_secs(3)).await;
        }
        assert!(h.requests.try_recv().is_err());
        assert!(h.registry.on_incoming_message(id, message(3)).await);

        let request = h.requests.recv().await.ok_or("expected a decision")?;
        let senders: Vec<u64> = request.context.iter().map(TrackedMessage::sender_id).collect();
        assert_eq!(senders, vec![1, 2, 3]);
        assert_eq!(request.prompt, "Reply?\n{context}");

        let (to, content) = h.sent.recv().await.ok_or("expected a follow-up")?;
        assert_eq!(to, id);
        assert_eq!(content, "ok, anything else?");
        assert_eq!(h.registry.state(id).await, Some(SessionState::Active));

        // Fresh budget: three more messages for the next decision.
        for n in 4..=6 {
            assert!(h.registry.on_incoming_message(id, message(n)).await);
        }
        let request = h.requests.recv().await.ok_or("expected a second decision")?;
        assert_eq!(request.context.len(), 3);
        assert_eq!(request.context[0].sender_id(), 4);

        let report = h.reports.recv().await.ok_or("expected termination")?;
        assert_eq!(report.reason, TerminationReason::Declined);
        assert_eq!(h.registry.state(id).await, None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn continue_extends_deadline_from_verdict_time() -> TestResult {
        let mut h = harness(
            vec![Ok(DecisionVerdict::proceed(Some("more?".to_string())))],
            Duration::ZERO,
        );
        let id = ConversationId::new(2);
        h.registry.start_tracking(id, &settings(30, 1)).await;

        tokio::time::advance(Duration::from_secs(20)).await;
        h.registry.on_incoming_message(id, message(1)).await;
        h.sent.recv().await.ok_or("expected a follow-up")?;
        let resumed = Instant::now();

        let report = h.reports.recv().await.ok_or("expected termination")?;
        assert_eq!(report.reason, TerminationReason::Timeout);
        assert!(within_a_second_of(resumed.elapsed(), 30));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_without_a_decision() -> TestResult {
        let mut h = harness(Vec::new(), Duration::ZERO);
        let id = ConversationId::new(3);
        let start = Instant::now();
        h.registry.start_tracking(id, &settings(30, 3)).await;

        let report = h.reports.recv().await.ok_or("expected termination")?;
        assert_eq!(report.conversation_id, id);
        assert_eq!(report.reason, TerminationReason::Timeout);
        assert!(within_a_second_of(start.elapsed(), 30));
        assert!(h.requests.try_recv().is_err());
        assert_eq!(h.registry.active_sessions().await, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn judgment_failure_ends_session_silently() -> TestResult {
        let mut h = harness(
            vec![Err(BotError::JudgmentUnavailable("503".to_string()))],
            Duration::ZERO,
        );
        let id = ConversationId::new(4);
        h.registry.start_tracking(id, &settings(30, 1)).await;
        h.registry.on_incoming_message(id, message(1)).await;

        let report = h.reports.recv().await.ok_or("expected termination")?;
        assert!(matches!(
            report.reason,
            TerminationReason::JudgmentUnavailable(_)
        ));
        assert!(h.sent.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn slow_judgment_times_out_as_unavailable() -> TestResult {
        let mut h = harness(
            vec![Ok(DecisionVerdict::proceed(Some("hi".to_string())))],
            Duration::from_secs(120),
        );
        let id = ConversationId::new(5);
        let mut settings = settings(0, 1);
        settings.judgment_timeout = Duration::from_secs(10);
        let start = Instant::now();
        h.registry.start_tracking(id, &settings).await;
        h.registry.on_incoming_message(id, message(1)).await;

        let report = h.reports.recv().await.ok_or("expected termination")?;
        assert!(matches!(
            report.reason,
            TerminationReason::JudgmentUnavailable(_)
        ));
        assert!(within_a_second_of(start.elapsed(), 10));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn late_verdict_does_not_revive_session() -> TestResult {
        let mut h = harness(
            vec![Ok(DecisionVerdict::proceed(Some("too late".to_string())))],
            Duration::from_secs(60),
        );
        let id = ConversationId::new(6);
        let start = Instant::now();
        h.registry.start_tracking(id, &settings(30, 1)).await;
        h.registry.on_incoming_message(id, message(1)).await;

        let report = h.reports.recv().await.ok_or("expected termination")?;
        assert_eq!(report.reason, TerminationReason::Timeout);
        assert!(within_a_second_of(start.elapsed(), 60));
        assert!(h.sent.try_recv().is_err());
        assert_eq!(h.registry.state(id).await, None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_during_decision_discards_verdict() -> TestResult {
        let mut h = harness(
            vec![Ok(DecisionVerdict::proceed(Some("ignored".to_string())))],
            Duration::from_secs(60),
        );
        let id = ConversationId::new(7);
        h.registry.start_tracking(id, &settings(300, 1)).await;
        h.registry.on_incoming_message(id, message(1)).await;
        h.requests.recv().await.ok_or("expected a decision")?;
        assert_eq!(
            h.registry.state(id).await,
            Some(SessionState::AwaitingDecision)
        );

        assert!(h.registry.terminate(id, TerminationReason::Cancelled).await);
        assert!(!h.registry.terminate(id, TerminationReason::Cancelled).await);
        let report = h.reports.recv().await.ok_or("expected termination")?;
        assert_eq!(report.reason, TerminationReason::Cancelled);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(h.sent.try_recv().is_err());
        assert!(h.reports.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn messages_during_decision_are_replayed() -> TestResult {
        let mut h = harness(
            vec![Ok(DecisionVerdict::proceed(None)), Ok(DecisionVerdict::stop())],
            Duration::from_secs(5),
        );
        let id = ConversationId::new(8);
        h.registry.start_tracking(id, &settings(60, 3)).await;
        for n in 1..=3 {
            h.registry.on_incoming_message(id, message(n)).await;
        }
        h.requests.recv().await.ok_or("expected a decision")?;
        for n in 4..=5 {
            h.registry.on_incoming_message(id, message(n)).await;
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.registry.state(id).await, Some(SessionState::Active));
        assert!(h.requests.try_recv().is_err());

        h.registry.on_incoming_message(id, message(6)).await;
        let request = h.requests.recv().await.ok_or("expected a second decision")?;
        let senders: Vec<u64> = request.context.iter().map(TrackedMessage::sender_id).collect();
        assert_eq!(senders, vec![4, 5, 6]);
        // Continue without content posts nothing.
        assert!(h.sent.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_start_keeps_existing_session() -> TestResult {
        let mut h = harness(Vec::new(), Duration::from_secs(60));
        let id = ConversationId::new(9);
        assert_eq!(
            h.registry.start_tracking(id, &settings(300, 2)).await,
            StartOutcome::Started
        );
        h.registry.on_incoming_message(id, message(1)).await;
        h.registry.on_incoming_message(id, message(2)).await;
        h.requests.recv().await.ok_or("expected a decision")?;

        assert_eq!(
            h.registry.start_tracking(id, &settings(5, 1)).await,
            StartOutcome::AlreadyTracking(SessionState::AwaitingDecision)
        );
        assert_eq!(h.registry.active_sessions().await, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_create_one_session() {
        let h = harness(Vec::new(), Duration::ZERO);
        let id = ConversationId::new(10);
        let settings = settings(30, 3);

        let outcomes = join_all((0..16).map(|_| h.registry.start_tracking(id, &settings))).await;
        let started = outcomes
            .iter()
            .filter(|outcome| **outcome == StartOutcome::Started)
            .count();
        assert_eq!(started, 1);
        assert!(outcomes.iter().all(|outcome| matches!(
            outcome,
            StartOutcome::Started | StartOutcome::AlreadyTracking(SessionState::Active)
        )));
        assert_eq!(h.registry.active_sessions().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_across_threads_create_one_session() {
        let h = harness(Vec::new(), Duration::ZERO);
        let id = ConversationId::new(11);
        let settings = settings(300, 3);

        let handles = (0..32).map(|_| {
            let registry = h.registry.clone();
            let settings = settings.clone();
            tokio::spawn(async move { registry.start_tracking(id, &settings).await })
        });
        let started = join_all(handles)
            .await
            .into_iter()
            .filter(|outcome| matches!(outcome, Ok(StartOutcome::Started)))
            .count();
        assert_eq!(started, 1);
        assert_eq!(h.registry.active_sessions().await, 1);
        h.registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn untracked_conversations_are_ignored() {
        let h = harness(Vec::new(), Duration::ZERO);
        let id = ConversationId::new(12);
        assert!(!h.registry.on_incoming_message(id, message(1)).await);
        assert!(!h.registry.terminate(id, TerminationReason::Cancelled).await);
        assert_eq!(h.registry.active_sessions().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_settings_start_nothing() {
        let h = harness(Vec::new(), Duration::ZERO);
        let id = ConversationId::new(13);
        assert_eq!(
            h.registry.start_tracking(id, &settings(0, 0)).await,
            StartOutcome::Disabled
        );
        let mut off = settings(30, 3);
        off.enabled = false;
        assert_eq!(
            h.registry.start_tracking(id, &off).await,
            StartOutcome::Disabled
        );
        assert_eq!(h.registry.active_sessions().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_only_times_out() -> TestResult {
        let mut h = harness(Vec::new(), Duration::ZERO);
        let id = ConversationId::new(14);
        h.registry.start_tracking(id, &settings(30, 0)).await;
        for n in 0..10 {
            assert!(h.registry.on_incoming_message(id, message(n)).await);
        }

        let report = h.reports.recv().await.ok_or("expected termination")?;
        assert_eq!(report.reason, TerminationReason::Timeout);
        assert!(h.requests.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn conversation_can_be_tracked_again_after_termination() -> TestResult {
        let mut h = harness(Vec::new(), Duration::ZERO);
        let id = ConversationId::new(15);
        h.registry.start_tracking(id, &settings(30, 3)).await;
        h.registry
            .terminate(id, TerminationReason::ConversationClosed)
            .await;
        let report = h.reports.recv().await.ok_or("expected termination")?;
        assert_eq!(report.reason, TerminationReason::ConversationClosed);

        assert_eq!(
            h.registry.start_tracking(id, &settings(30, 3)).await,
            StartOutcome::Started
        );
        assert_eq!(h.registry.state(id).await, Some(SessionState::Active));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_every_session() -> TestResult {
        let mut h = harness(Vec::new(), Duration::ZERO);
        for chat in 20..23 {
            h.registry
                .start_tracking(ConversationId::new(chat), &settings(30, 3))
                .await;
        }
        assert_eq!(h.registry.active_sessions().await, 3);

        h.registry.shutdown().await;
        assert_eq!(h.registry.active_sessions().await, 0);
        for _ in 0..3 {
            let report = h.reports.recv().await.ok_or("expected termination")?;
            assert_eq!(report.reason, TerminationReason::Shutdown);
        }
        Ok(())
    }
}
