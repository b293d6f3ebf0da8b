//! Session state
//!
//! A [`Session`] is one long-lived conversation. It owns its input bridge,
//! event bus and engine control, and tracks:
//!
//! - the lifecycle state machine
//!   (`initializing → ready → processing ⇄ idle → closing → closed`)
//! - the bounded FIFO correlating tool announcements with their results
//! - the active approval plan
//! - the per-turn timer and cancellation tokens
//!
//! Sessions are created and torn down only by the registry.

use crate::engine::EngineControl;
use crate::event::{ErrorKind, SessionEvent};
use crate::event_bus::EventBus;
use crate::input::InputStream;
use crate::plan::ActivePlan;
use crate::types::{ActorContext, ApprovalMode, TokenUsage};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, engine startup not yet confirmed
    Initializing,
    /// Engine confirmed startup, no turn has run yet
    Ready,
    /// A turn is in flight
    Processing,
    /// Between turns
    Idle,
    /// Teardown started
    Closing,
    /// Resources released
    Closed,
}

impl SessionState {
    /// Whether a new turn may start from this state
    pub fn can_begin_turn(self) -> bool {
        matches!(
            self,
            SessionState::Initializing | SessionState::Ready | SessionState::Idle
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Processing => "processing",
            SessionState::Idle => "idle",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// A tool announcement waiting for its result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingToolUse {
    pub tool_use_id: String,
    pub tool_name: String,
}

/// A plan step consumed by a gated call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStepMatch {
    pub plan_id: String,
    pub step_index: usize,
    pub description: Option<String>,
}

/// A plan step whose tool call finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStepProgress {
    pub plan_id: String,
    pub step_index: usize,
    /// Every step of the plan has now finished
    pub plan_finished: bool,
}

/// Usage accumulated over the session's turns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionTotals {
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub turns: u64,
}

/// Construction parameters
#[derive(Debug, Clone)]
pub struct SessionInit {
    pub id: String,
    pub actor: ActorContext,
    pub approval_mode: ApprovalMode,
    pub allowed_tools: Vec<String>,
    /// Conversation id restored from storage
    pub conversation_id: Option<String>,
    pub replay_capacity: usize,
    pub tool_queue_capacity: usize,
}

struct TurnControl {
    token: CancellationToken,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

/// One conversation
pub struct Session {
    id: String,
    approval_mode: ApprovalMode,
    allowed_tools: Vec<String>,
    state: Mutex<SessionState>,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    actor: RwLock<ActorContext>,
    tool_queue: Mutex<VecDeque<PendingToolUse>>,
    tool_queue_capacity: usize,
    plan: Mutex<Option<ActivePlan>>,
    paused: AtomicBool,
    input: InputStream,
    events: EventBus,
    engine: OnceLock<Arc<dyn EngineControl>>,
    cancel: CancellationToken,
    turn: Mutex<TurnControl>,
    /// A timed-out turn may still report; cleared when the next turn starts
    stale_result: AtomicBool,
    totals: Mutex<SessionTotals>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub fn new(init: SessionInit) -> Self {
        let input = match init.conversation_id {
            Some(conversation_id) => InputStream::resumed(init.id.clone(), conversation_id),
            None => InputStream::new(init.id.clone()),
        };
        let cancel = CancellationToken::new();
        let now = Instant::now();
        Self {
            events: EventBus::new(init.id.clone(), init.replay_capacity),
            input,
            approval_mode: init.approval_mode,
            allowed_tools: init.allowed_tools,
            state: Mutex::new(SessionState::Initializing),
            created_at: now,
            last_activity: Mutex::new(now),
            actor: RwLock::new(init.actor),
            tool_queue: Mutex::new(VecDeque::new()),
            tool_queue_capacity: init.tool_queue_capacity.max(1),
            plan: Mutex::new(None),
            paused: AtomicBool::new(false),
            engine: OnceLock::new(),
            turn: Mutex::new(TurnControl {
                token: cancel.child_token(),
                timer: None,
                generation: 0,
            }),
            cancel,
            stale_result: AtomicBool::new(false),
            totals: Mutex::new(SessionTotals::default()),
            id: init.id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn input(&self) -> &InputStream {
        &self.input
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        let mut state = lock(&self.state);
        if !from.contains(&state) {
            return false;
        }
        tracing::debug!(session_id = %self.id, from = %*state, to = %to, "Session state transition");
        *state = to;
        true
    }

    /// `initializing → ready`, once the engine confirmed startup
    pub fn mark_ready(&self) -> bool {
        self.transition(&[SessionState::Initializing], SessionState::Ready)
    }

    /// Enter `processing` unless a turn is already in flight or the session is closing
    pub fn try_begin_processing(&self) -> bool {
        self.transition(
            &[
                SessionState::Initializing,
                SessionState::Ready,
                SessionState::Idle,
            ],
            SessionState::Processing,
        )
    }

    /// Arm the per-turn timer and open a fresh turn cancellation scope
    pub fn start_turn(self: &Arc<Self>, timeout: Duration) {
        let mut turn = lock(&self.turn);
        if let Some(timer) = turn.timer.take() {
            timer.abort();
        }
        turn.generation += 1;
        turn.token = self.cancel.child_token();
        // A result the engine yields after this point belongs to the new turn.
        self.stale_result.store(false, Ordering::SeqCst);

        let generation = turn.generation;
        let session = Arc::downgrade(self);
        turn.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = session.upgrade() {
                session.on_turn_timeout(generation, timeout).await;
            }
        }));
    }

    async fn on_turn_timeout(&self, generation: u64, timeout: Duration) {
        {
            let mut turn = lock(&self.turn);
            if turn.generation != generation {
                return;
            }
            turn.timer = None;
            turn.token.cancel();
            if !self.transition(&[SessionState::Processing], SessionState::Idle) {
                return;
            }
            // Set under the turn lock so a racing `start_turn` clears it.
            self.stale_result.store(true, Ordering::SeqCst);
        }

        tracing::warn!(
            session_id = %self.id,
            timeout_secs = timeout.as_secs(),
            "Turn timed out, forcing idle"
        );
        self.drain_tool_queue("Turn timed out before the tool result was observed");
        self.events.publish(SessionEvent::error(
            ErrorKind::TurnTimeout,
            format!("Turn timed out after {} seconds", timeout.as_secs()),
        ));
        self.events.publish(SessionEvent::done());

        if let Err(e) = self.interrupt_engine().await {
            tracing::debug!(session_id = %self.id, error = %e, "Interrupt after turn timeout failed");
        }
    }

    /// Whether a result is the late report of a timed-out turn
    ///
    /// Only a result arriving between the timeout and the next `start_turn`
    /// counts; at most one is discarded. An engine that never reports the
    /// timed-out turn leaves nothing owed.
    pub fn discard_stale_result(&self) -> bool {
        self.stale_result.swap(false, Ordering::SeqCst)
    }

    /// Stop the per-turn timer without touching state
    pub fn disarm_turn_timer(&self) {
        if let Some(timer) = lock(&self.turn).timer.take() {
            timer.abort();
        }
    }

    /// `processing → idle`; cancels the turn scope and disarms its timer
    pub fn finish_turn(&self) -> bool {
        {
            let mut turn = lock(&self.turn);
            if let Some(timer) = turn.timer.take() {
                timer.abort();
            }
            turn.token.cancel();
        }
        self.transition(&[SessionState::Processing], SessionState::Idle)
    }

    /// Token cancelled when the current turn ends, times out or the session closes
    pub fn turn_token(&self) -> CancellationToken {
        lock(&self.turn).token.clone()
    }

    /// Cancel whatever the current turn is waiting on
    pub fn cancel_turn(&self) {
        lock(&self.turn).token.cancel();
    }

    /// Token cancelled when the session is torn down
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Enter `closing`; only the first caller gets true
    pub(crate) fn begin_close(&self) -> bool {
        self.transition(
            &[
                SessionState::Initializing,
                SessionState::Ready,
                SessionState::Processing,
                SessionState::Idle,
            ],
            SessionState::Closing,
        )
    }

    /// Release owned resources and enter `closed`
    ///
    /// Must follow a successful `begin_close`.
    pub(crate) async fn teardown(&self) {
        self.cancel.cancel();
        self.disarm_turn_timer();
        self.input.close();
        if let Some(engine) = self.engine.get() {
            if let Err(e) = engine.close().await {
                tracing::warn!(session_id = %self.id, error = %e, "Engine close failed");
            }
        }
        self.events.close_all();
        self.transition(&[SessionState::Closing], SessionState::Closed);
        tracing::info!(session_id = %self.id, "Session closed");
    }

    // ========================================================================
    // Engine
    // ========================================================================

    pub(crate) fn attach_engine(&self, control: Arc<dyn EngineControl>) {
        if self.engine.set(control).is_err() {
            tracing::warn!(session_id = %self.id, "Engine already attached, ignoring");
        }
    }

    pub(crate) async fn interrupt_engine(&self) -> crate::error::Result<()> {
        match self.engine.get() {
            Some(engine) => engine.interrupt().await,
            None => Err(crate::error::SessionError::Engine(format!(
                "no engine attached to session {}",
                self.id
            ))),
        }
    }

    // ========================================================================
    // Activity and context
    // ========================================================================

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    pub fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn actor(&self) -> ActorContext {
        self.actor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_actor(&self, actor: ActorContext) {
        *self.actor.write().unwrap_or_else(PoisonError::into_inner) = actor;
    }

    pub fn approval_mode(&self) -> ApprovalMode {
        self.approval_mode
    }

    /// Mode gating actually uses; a paused session always asks per step
    pub fn effective_approval_mode(&self) -> ApprovalMode {
        if self.is_paused() {
            ApprovalMode::PerStep
        } else {
            self.approval_mode
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn allowed_tools(&self) -> &[String] {
        &self.allowed_tools
    }

    /// Whether the session's tool list admits this tool; empty admits all
    pub fn allows_tool(&self, tool_name: &str) -> bool {
        self.allowed_tools.is_empty() || self.allowed_tools.iter().any(|t| t == tool_name)
    }

    pub fn totals(&self) -> SessionTotals {
        lock(&self.totals).clone()
    }

    pub(crate) fn record_usage(&self, usage: &TokenUsage, cost_usd: f64) -> SessionTotals {
        let mut totals = lock(&self.totals);
        totals.usage.add(usage);
        totals.cost_usd += cost_usd;
        totals.turns += 1;
        totals.clone()
    }

    // ========================================================================
    // Tool correlation
    // ========================================================================

    /// Queue an announced tool call; returns the oldest entry if it was pushed out
    pub fn push_tool_use(
        &self,
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Option<PendingToolUse> {
        let mut queue = lock(&self.tool_queue);
        let evicted = if queue.len() >= self.tool_queue_capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(PendingToolUse {
            tool_use_id: tool_use_id.into(),
            tool_name: tool_name.into(),
        });
        evicted
    }

    /// Oldest announced call still waiting for its result
    pub fn pop_tool_use(&self) -> Option<PendingToolUse> {
        lock(&self.tool_queue).pop_front()
    }

    pub fn pending_tool_uses(&self) -> usize {
        lock(&self.tool_queue).len()
    }

    /// Close out every announced call with an error result
    pub(crate) fn drain_tool_queue(&self, reason: &str) -> usize {
        let drained: Vec<_> = lock(&self.tool_queue).drain(..).collect();
        for pending in &drained {
            self.events.publish(SessionEvent::ToolResult {
                tool_use_id: pending.tool_use_id.clone(),
                tool_name: pending.tool_name.clone(),
                output: serde_json::Value::String(reason.to_string()),
                is_error: true,
            });
        }
        drained.len()
    }

    // ========================================================================
    // Approval plan
    // ========================================================================

    /// Install a plan, returning the one it replaced
    pub fn replace_plan(&self, plan: ActivePlan) -> Option<ActivePlan> {
        lock(&self.plan).replace(plan)
    }

    pub fn take_plan(&self) -> Option<ActivePlan> {
        lock(&self.plan).take()
    }

    pub fn active_plan_id(&self) -> Option<String> {
        lock(&self.plan).as_ref().map(|p| p.id().to_string())
    }

    /// Index of the next expected plan step
    pub fn plan_progress(&self) -> Option<(String, usize)> {
        lock(&self.plan)
            .as_ref()
            .map(|p| (p.id().to_string(), p.next_index()))
    }

    /// Consume the next plan step if this call matches it
    pub fn advance_plan(&self, tool_name: &str, input: &serde_json::Value) -> Option<PlanStepMatch> {
        let mut plan = lock(&self.plan);
        let active = plan.as_mut()?;
        let step_index = active.try_advance(tool_name, input)?;
        Some(PlanStepMatch {
            plan_id: active.id().to_string(),
            step_index,
            description: active.step(step_index).and_then(|s| s.description.clone()),
        })
    }

    /// Record that a plan step's tool call finished
    pub fn complete_plan_step(&self, tool_name: &str) -> Option<PlanStepProgress> {
        let mut plan = lock(&self.plan);
        let active = plan.as_mut()?;
        let step_index = active.complete_step(tool_name)?;
        Some(PlanStepProgress {
            plan_id: active.id().to_string(),
            step_index,
            plan_finished: active.is_complete(),
        })
    }

    /// Remove the plan only if it is still the one identified by `plan_id`
    pub fn take_plan_if(&self, plan_id: &str) -> Option<ActivePlan> {
        let mut plan = lock(&self.plan);
        if plan.as_ref().is_some_and(|p| p.id() == plan_id) {
            plan.take()
        } else {
            None
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("approval_mode", &self.approval_mode)
            .field("paused", &self.is_paused())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ApprovalPlan, PlanStep};
    use serde_json::json;

    fn session() -> Arc<Session> {
        Arc::new(Session::new(SessionInit {
            id: "s1".to_string(),
            actor: ActorContext::new("u1", "org1"),
            approval_mode: ApprovalMode::ActionPlan,
            allowed_tools: vec![],
            conversation_id: None,
            replay_capacity: 100,
            tool_queue_capacity: 2,
        }))
    }

    #[test]
    fn test_processing_is_exclusive() {
        let s = session();
        assert_eq!(s.state(), SessionState::Initializing);
        assert!(s.try_begin_processing());
        assert!(!s.try_begin_processing());
        assert_eq!(s.state(), SessionState::Processing);

        assert!(s.finish_turn());
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!s.finish_turn());
        assert!(s.try_begin_processing());
    }

    #[test]
    fn test_concurrent_begin_processing_has_one_winner() {
        let s = session();
        s.mark_ready();
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| s.try_begin_processing() as usize))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_closing_blocks_new_turns() {
        let s = session();
        assert!(s.mark_ready());
        assert!(!s.mark_ready());
        assert!(s.begin_close());
        assert!(!s.begin_close());
        assert!(!s.try_begin_processing());

        s.teardown().await;
        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.events().is_closed());
        assert!(s.input().is_closed());
        assert!(s.cancellation_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_timeout_forces_idle() {
        let s = session();
        let mut sub = s.events().subscribe("viewer");
        assert!(s.try_begin_processing());
        s.push_tool_use("toolu_1", "run_script");
        s.start_turn(Duration::from_secs(600));
        let turn_token = s.turn_token();

        tokio::time::sleep(Duration::from_secs(601)).await;

        assert_eq!(s.state(), SessionState::Idle);
        assert!(turn_token.is_cancelled());
        assert_eq!(s.pending_tool_uses(), 0);

        let kinds: Vec<&str> = vec![
            sub.recv().await.unwrap().event.kind(),
            sub.recv().await.unwrap().event.kind(),
            sub.recv().await.unwrap().event.kind(),
        ];
        assert_eq!(kinds, vec!["tool_result", "error", "done"]);

        // The late result of the timed-out turn is discarded once
        assert!(s.discard_stale_result());
        assert!(!s.discard_stale_result());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_turn_clears_unreported_timeout() {
        let s = session();
        assert!(s.try_begin_processing());
        s.start_turn(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(s.state(), SessionState::Idle);

        // The engine never reports the timed-out turn; the next turn's result is its own
        assert!(s.try_begin_processing());
        s.start_turn(Duration::from_secs(10));
        assert!(!s.discard_stale_result());
        assert!(s.finish_turn());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_turn_disarms_timer() {
        let s = session();
        assert!(s.try_begin_processing());
        s.start_turn(Duration::from_secs(10));
        assert!(s.finish_turn());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!s.discard_stale_result());
        assert_eq!(s.events().buffered(), 0);
    }

    #[test]
    fn test_tool_queue_is_fifo_and_bounded() {
        let s = session();
        assert!(s.push_tool_use("a", "query_devices").is_none());
        assert!(s.push_tool_use("b", "query_devices").is_none());
        let evicted = s.push_tool_use("c", "query_devices").unwrap();
        assert_eq!(evicted.tool_use_id, "a");

        assert_eq!(s.pop_tool_use().unwrap().tool_use_id, "b");
        assert_eq!(s.pop_tool_use().unwrap().tool_use_id, "c");
        assert!(s.pop_tool_use().is_none());
    }

    #[test]
    fn test_paused_session_forces_per_step() {
        let s = session();
        assert_eq!(s.effective_approval_mode(), ApprovalMode::ActionPlan);
        s.set_paused(true);
        assert_eq!(s.effective_approval_mode(), ApprovalMode::PerStep);
        assert_eq!(s.approval_mode(), ApprovalMode::ActionPlan);
        s.set_paused(false);
        assert_eq!(s.effective_approval_mode(), ApprovalMode::ActionPlan);
    }

    #[test]
    fn test_plan_progress() {
        let s = session();
        let plan = ApprovalPlan::new(
            "s1",
            vec![
                PlanStep::new("toolA", json!({"target": "x"})).with_description("first"),
                PlanStep::new("toolB", json!({"target": "y"})),
            ],
        );
        let plan_id = plan.id.clone();
        assert!(s.replace_plan(ActivePlan::new(plan).unwrap()).is_none());

        let matched = s.advance_plan("toolA", &json!({"target": "x"})).unwrap();
        assert_eq!(matched.step_index, 0);
        assert_eq!(matched.description.as_deref(), Some("first"));
        assert_eq!(s.plan_progress(), Some((plan_id.clone(), 1)));
        assert!(s.advance_plan("toolC", &json!({"target": "y"})).is_none());

        let progress = s.complete_plan_step("toolA").unwrap();
        assert!(!progress.plan_finished);

        assert!(s.take_plan_if("plan-other").is_none());
        assert!(s.take_plan_if(&plan_id).is_some());
        assert!(s.active_plan_id().is_none());
    }

    #[test]
    fn test_allowed_tools() {
        let s = Session::new(SessionInit {
            id: "s2".to_string(),
            actor: ActorContext::default(),
            approval_mode: ApprovalMode::PerStep,
            allowed_tools: vec!["query_devices".to_string()],
            conversation_id: Some("conv-1".to_string()),
            replay_capacity: 10,
            tool_queue_capacity: 10,
        });
        assert!(s.allows_tool("query_devices"));
        assert!(!s.allows_tool("run_script"));
        assert_eq!(s.input().conversation_id(), Some("conv-1"));
        assert!(session().allows_tool("anything"));
    }
}
