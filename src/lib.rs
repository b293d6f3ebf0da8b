//! # a3s-session
//!
//! Session orchestration core for A3S fleet assistants.
//!
//! ## Overview
//!
//! An operator holds a long-lived conversation with an agent that can run
//! sensitive fleet operations (scripts, file changes, service restarts) on
//! managed devices. `a3s-session` keeps one engine alive per conversation,
//! fans its output out to reconnecting viewers, and puts a risk-tiered
//! approval gate in front of every tool call.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use a3s_session::{
//!     ActorContext, CoreConfig, DefaultPolicy, Guardrail, MemoryAuditLog,
//!     MemorySessionStore, SessionOptions, SessionRegistry, ToolCatalog,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(engine: Arc<dyn a3s_session::QueryEngineFactory>) -> a3s_session::Result<()> {
//! let config = CoreConfig::default();
//! let store = Arc::new(MemorySessionStore::new());
//! let guardrail = Arc::new(Guardrail::new(
//!     Arc::new(ToolCatalog::fleet()),
//!     Arc::new(DefaultPolicy::new()),
//!     store.clone(),
//!     Arc::new(MemoryAuditLog::default()),
//!     &config.guardrail,
//! ));
//! let registry = SessionRegistry::new(config.registry, engine, guardrail, store);
//! registry.start_sweeper();
//!
//! let session = registry
//!     .get_or_create("s1", SessionOptions::new(ActorContext::new("u1", "org1")))
//!     .await?;
//! let mut events = registry.subscribe(session.id(), "browser-tab-1", Some(0))?;
//! registry.send_message(session.id(), "Which devices are offline?").await?;
//!
//! while let Some(envelope) = events.recv().await {
//!     println!("{}: {:?}", envelope.sequence, envelope.event);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **SessionRegistry**: bounded table of live sessions with idle, age and
//!   LRU eviction
//! - **Session**: lifecycle state machine, tool-use FIFO, plan progress,
//!   per-turn timer
//! - **InputStream**: ordered user-message feed handed to the engine once
//! - **EventBus**: per-session fan-out with a replay ring buffer
//! - **Guardrail**: risk classification, policy checks and the approval gate
//! - **background processor**: drains engine output into events and transcript
//!
//! Collaborators outside the core are traits: [`QueryEngineFactory`],
//! [`RiskClassifier`], [`PolicyChecker`], [`TargetInspector`],
//! [`SessionStore`] and [`AuditSink`].

pub mod approval;
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod guardrail;
pub mod input;
pub mod plan;
pub mod policy;
mod processor;
pub mod registry;
pub mod session;
pub mod store;
pub mod types;

// Re-export core types
pub use approval::{ApprovalGate, ApprovalOutcome};
pub use audit::{AuditEntry, AuditResult, AuditSink, MemoryAuditLog};
pub use config::{CoreConfig, GuardrailConfig, RegistryConfig};
pub use engine::{
    ContentBlock, EngineControl, EngineHandle, EngineMessage, EngineOutput, EngineRequest,
    Fragment, GateDecision, QueryEngineFactory, ToolHooks, ToolOutput, ToolTicket, TurnOutcome,
    TurnResult,
};
pub use error::{Result, SessionError};
pub use event::{ErrorKind, EventEnvelope, SessionEvent};
pub use event_bus::{EventBus, Subscription, DEFAULT_REPLAY_CAPACITY};
pub use guardrail::{Guardrail, SessionToolGate};
pub use input::{InputFeed, InputStream, UserMessage};
pub use plan::{ActivePlan, ApprovalPlan, PlanStatus, PlanStep, PLAN_KEY_FIELDS};
pub use policy::{
    DefaultPolicy, PolicyChecker, PolicyDecision, RiskClassifier, TargetInspector, ToolCatalog,
};
pub use registry::{SessionOptions, SessionRegistry};
pub use session::{Session, SessionState};
pub use store::{InvocationUpdate, MemorySessionStore, SessionRecord, SessionStore};
pub use types::{
    ActorContext, ApprovalMode, InvocationStatus, RiskTier, TokenUsage, ToolInvocationRecord,
    TranscriptEntry, TranscriptRole,
};
