//! Session registry
//!
//! The process-wide table of live sessions. Every access to the table goes
//! through a short, non-async critical section; teardown work (engine close,
//! bus close) always happens after the entry has left the table.
//!
//! ## Eviction
//!
//! - **capacity**: creating a session at `max_sessions` evicts the
//!   least-recently-active one
//! - **idle**: sessions untouched for `idle_timeout` are evicted by the sweeper
//! - **age**: sessions older than `max_age` are evicted by the sweeper
//!
//! Evicted sessions publish an `error` + `done` pair before teardown so
//! connected viewers learn why their stream ended.

use crate::config::RegistryConfig;
use crate::engine::{EngineRequest, QueryEngineFactory};
use crate::error::{Result, SessionError};
use crate::event::{ErrorKind, SessionEvent};
use crate::event_bus::Subscription;
use crate::guardrail::{Guardrail, SessionToolGate};
use crate::plan::PlanStep;
use crate::processor::BackgroundProcessor;
use crate::session::{Session, SessionInit, SessionState};
use crate::store::{SessionRecord, SessionStore};
use crate::types::{ActorContext, ApprovalMode, TranscriptEntry, TranscriptRole};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Per-request parameters for creating or resuming a session
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub actor: ActorContext,
    pub system_prompt: Option<String>,
    /// Remaining budget for the engine, in USD
    pub max_budget_usd: Option<f64>,
    /// Tools the session may use; empty admits every classified tool
    pub allowed_tools: Vec<String>,
    pub approval_mode: ApprovalMode,
}

impl SessionOptions {
    pub fn new(actor: ActorContext) -> Self {
        Self {
            actor,
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_budget(mut self, max_budget_usd: f64) -> Self {
        self.max_budget_usd = Some(max_budget_usd);
        self
    }

    pub fn with_allowed_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }
}

/// Why a session was evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvictionReason {
    Capacity,
    Idle,
    MaxAge,
    Shutdown,
}

impl EvictionReason {
    fn message(self) -> &'static str {
        match self {
            EvictionReason::Capacity => {
                "Session closed to make room for a new conversation; start a new session to continue"
            }
            EvictionReason::Idle => "Session closed after a period of inactivity",
            EvictionReason::MaxAge => "Session reached its maximum lifetime and was closed",
            EvictionReason::Shutdown => "Session closed because the server is shutting down",
        }
    }
}

struct RegistryInner {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    config: RegistryConfig,
    engine: Arc<dyn QueryEngineFactory>,
    guardrail: Arc<Guardrail>,
    store: Arc<dyn SessionStore>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Bounded table of live sessions
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        config: RegistryConfig,
        engine: Arc<dyn QueryEngineFactory>,
        guardrail: Arc<Guardrail>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                config,
                engine,
                guardrail,
                store,
                shutdown: CancellationToken::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn guardrail(&self) -> &Arc<Guardrail> {
        &self.inner.guardrail
    }

    /// Live session by id
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.table()
            .get(session_id)
            .filter(|s| !s.state().is_terminal())
            .cloned()
    }

    fn require(&self, session_id: &str) -> Result<Arc<Session>> {
        self.get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.table().keys().cloned().collect();
        ids.sort();
        ids
    }

    // ========================================================================
    // Create / resume
    // ========================================================================

    /// Reuse a live session or build, register and start a new one
    pub async fn get_or_create(
        &self,
        session_id: &str,
        options: SessionOptions,
    ) -> Result<Arc<Session>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SessionError::Closed("registry is shut down".to_string()));
        }
        if let Some(session) = self.get(session_id) {
            session.set_actor(options.actor);
            session.touch();
            tracing::debug!(session_id = %session_id, "Reusing live session");
            return Ok(session);
        }

        let store = &self.inner.store;
        let record = store.load_session(session_id).await.unwrap_or_else(|e| {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to load session record");
            None
        });
        let persisted_plan = store.load_active_plan(session_id).await.unwrap_or_else(|e| {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to load active plan");
            None
        });

        let resume_conversation_id = record.as_ref().and_then(|r| r.conversation_id.clone());
        let session = Arc::new(Session::new(SessionInit {
            id: session_id.to_string(),
            actor: options.actor.clone(),
            approval_mode: options.approval_mode,
            allowed_tools: options.allowed_tools.clone(),
            conversation_id: resume_conversation_id.clone(),
            replay_capacity: self.inner.config.replay_capacity,
            tool_queue_capacity: self.inner.config.tool_queue_capacity,
        }));

        if let Some(plan) = persisted_plan {
            match crate::plan::ActivePlan::new(plan) {
                Ok(active) => {
                    tracing::info!(session_id = %session_id, plan_id = %active.id(), "Restored active plan");
                    session.replace_plan(active);
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Ignoring unusable persisted plan")
                }
            }
        }

        let (registered, evicted) = {
            let mut table = self.table();
            match table.get(session_id) {
                // Another caller won the race while we were loading
                Some(existing) if !existing.state().is_terminal() => {
                    (existing.clone(), None)
                }
                _ => {
                    let evicted = if table.len() >= self.inner.config.max_sessions {
                        Self::take_least_recent(&mut table)
                    } else {
                        None
                    };
                    table.insert(session_id.to_string(), session.clone());
                    (session.clone(), evicted)
                }
            }
        };
        if !Arc::ptr_eq(&registered, &session) {
            registered.set_actor(options.actor);
            registered.touch();
            return Ok(registered);
        }

        if let Some(victim) = evicted {
            tracing::info!(
                session_id = %victim.id(),
                "At capacity, evicting least recently active session"
            );
            evict(&victim, EvictionReason::Capacity).await;
        }

        let hooks = Arc::new(SessionToolGate::new(
            session.clone(),
            self.inner.guardrail.clone(),
        ));
        let Some(input) = session.input().take_feed() else {
            self.remove(session_id).await;
            return Err(SessionError::Engine(format!(
                "input feed for {} already taken",
                session_id
            )));
        };
        let request = EngineRequest {
            session_id: session_id.to_string(),
            input,
            system_prompt: options.system_prompt,
            allowed_tools: options.allowed_tools,
            max_budget_usd: options.max_budget_usd,
            resume_conversation_id,
            hooks,
        };

        let handle = match self.inner.engine.start(request) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Engine failed to start");
                self.remove(session_id).await;
                return Err(e);
            }
        };
        session.attach_engine(handle.control);
        BackgroundProcessor::new(
            session.clone(),
            self.clone(),
            self.inner.store.clone(),
            handle.output,
        )
        .spawn();

        if record.is_none() {
            let record = SessionRecord::new(session_id, options.actor);
            if let Err(e) = self.inner.store.save_session(&record).await {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to persist session record");
            }
        }

        tracing::info!(
            session_id = %session_id,
            resumed = record.is_some(),
            approval_mode = ?session.approval_mode(),
            "Session created"
        );
        Ok(session)
    }

    fn take_least_recent(table: &mut HashMap<String, Arc<Session>>) -> Option<Arc<Session>> {
        let victim_id = table
            .values()
            .min_by_key(|s| s.last_activity())
            .map(|s| s.id().to_string())?;
        let victim = table.remove(&victim_id)?;
        victim.begin_close();
        Some(victim)
    }

    // ========================================================================
    // Removal and sweeping
    // ========================================================================

    /// Tear a session down; removing an absent or closed session is a no-op
    pub async fn remove(&self, session_id: &str) {
        let session = {
            let mut table = self.table();
            match table.get(session_id) {
                Some(session) if session.begin_close() => table.remove(session_id),
                _ => None,
            }
        };
        if let Some(session) = session {
            session.teardown().await;
        }
    }

    /// Remove `session` only if it is still the registered entry for its id
    pub(crate) async fn release(&self, session: &Arc<Session>) {
        let removed = {
            let mut table = self.table();
            match table.get(session.id()) {
                Some(current) if Arc::ptr_eq(current, session) && session.begin_close() => {
                    table.remove(session.id())
                }
                _ => None,
            }
        };
        if let Some(session) = removed {
            session.teardown().await;
        }
    }

    /// Evict sessions past the idle threshold or maximum age; returns how many
    pub async fn sweep_once(&self) -> usize {
        let config = &self.inner.config;
        let (idle_timeout, max_age) = (config.idle_timeout(), config.max_age());

        let expired: Vec<(Arc<Session>, EvictionReason)> = {
            let mut table = self.table();
            let ids: Vec<(String, EvictionReason)> = table
                .values()
                .filter_map(|s| {
                    if s.age() > max_age {
                        Some((s.id().to_string(), EvictionReason::MaxAge))
                    } else if s.idle_for() > idle_timeout {
                        Some((s.id().to_string(), EvictionReason::Idle))
                    } else {
                        None
                    }
                })
                .collect();
            ids.into_iter()
                .filter_map(|(id, reason)| {
                    let session = table.remove(&id)?;
                    session.begin_close().then_some((session, reason))
                })
                .collect()
        };

        for (session, reason) in &expired {
            tracing::info!(
                session_id = %session.id(),
                reason = ?reason,
                idle_secs = session.idle_for().as_secs(),
                age_secs = session.age().as_secs(),
                "Evicting session"
            );
            evict(session, *reason).await;
        }
        expired.len()
    }

    /// Run `sweep_once` every `sweep_interval` until shutdown
    pub fn start_sweeper(&self) {
        let mut slot = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let registry = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.sweep_interval().max(Duration::from_millis(1));
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = registry.sweep_once().await;
                        if evicted > 0 {
                            tracing::info!(evicted = evicted, "Session sweep finished");
                        }
                    }
                }
            }
            tracing::debug!("Session sweeper stopped");
        }));
    }

    /// Stop the sweeper and close every session
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        let sessions: Vec<Arc<Session>> = {
            let mut table = self.table();
            table
                .drain()
                .map(|(_, s)| s)
                .filter(|s| s.begin_close())
                .collect()
        };
        tracing::info!(sessions = sessions.len(), "Shutting down session registry");
        for session in &sessions {
            evict(session, EvictionReason::Shutdown).await;
        }
    }

    // ========================================================================
    // Per-session operations
    // ========================================================================

    /// Start a turn with a new user message
    pub async fn send_message(&self, session_id: &str, text: impl Into<String>) -> Result<()> {
        let session = self.require(session_id)?;
        if !session.try_begin_processing() {
            return Err(match session.state() {
                SessionState::Processing => SessionError::Busy(session_id.to_string()),
                _ => SessionError::Closed(session_id.to_string()),
            });
        }
        session.start_turn(self.inner.config.turn_timeout());

        let text = text.into();
        let entry = TranscriptEntry::new(
            session_id,
            TranscriptRole::User,
            serde_json::Value::String(text.clone()),
        );
        if let Err(e) = self.inner.store.append_transcript(&entry).await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to persist user message");
        }

        if let Err(e) = session.input().push(text) {
            session.finish_turn();
            return Err(e);
        }
        session.touch();
        tracing::debug!(session_id = %session_id, "Turn started");
        Ok(())
    }

    /// Subscribe to a session's events, optionally replaying from a sequence number
    pub fn subscribe(
        &self,
        session_id: &str,
        subscriber_id: &str,
        replay_from: Option<u64>,
    ) -> Result<Subscription> {
        let session = self.require(session_id)?;
        Ok(session.events().subscribe_from(subscriber_id, replay_from))
    }

    /// Interrupt the running turn; false if nothing was running or the engine refused
    pub async fn interrupt(&self, session_id: &str) -> Result<bool> {
        let session = self.require(session_id)?;
        if session.state() != SessionState::Processing {
            return Ok(false);
        }
        session.cancel_turn();
        match session.interrupt_engine().await {
            Ok(()) => {
                tracing::info!(session_id = %session_id, "Turn interrupted");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Engine interrupt failed");
                Ok(false)
            }
        }
    }

    /// Deliver a human decision to a waiting gated call
    pub fn resolve_approval(&self, execution_id: &str, approved: bool) -> bool {
        self.inner.guardrail.resolve_approval(execution_id, approved)
    }

    /// Activate a pre-approved plan; returns its id
    pub async fn activate_plan(&self, session_id: &str, steps: Vec<PlanStep>) -> Result<String> {
        let session = self.require(session_id)?;
        session.touch();
        self.inner.guardrail.activate_plan(&session, steps).await
    }

    /// Abort the active plan; returns its id if there was one
    pub async fn abort_plan(&self, session_id: &str) -> Result<Option<String>> {
        let session = self.require(session_id)?;
        Ok(self.inner.guardrail.abort_plan(&session).await)
    }

    /// Force per-step approval for every gated call until resumed
    pub fn pause(&self, session_id: &str) -> Result<()> {
        let session = self.require(session_id)?;
        session.set_paused(true);
        tracing::info!(session_id = %session_id, "Session paused");
        Ok(())
    }

    pub fn resume(&self, session_id: &str) -> Result<()> {
        let session = self.require(session_id)?;
        session.set_paused(false);
        tracing::info!(session_id = %session_id, "Session resumed");
        Ok(())
    }
}

/// Notify viewers, then tear down a session already taken out of the table
async fn evict(session: &Session, reason: EvictionReason) {
    session
        .events()
        .publish(SessionEvent::error(ErrorKind::SessionEvicted, reason.message()));
    session.events().publish(SessionEvent::done());
    session.teardown().await;
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("max_sessions", &self.inner.config.max_sessions)
            .finish()
    }
}
