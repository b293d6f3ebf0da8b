//! Persistence collaborator
//!
//! The core never owns a schema; it talks to storage through `SessionStore`.
//! Every write is best-effort from the caller's point of view except the
//! `pending` approval record, without which no approval can be granted.
//!
//! `MemorySessionStore` is the in-process implementation used for embedding
//! and tests.

use crate::error::{Result, SessionError};
use crate::plan::{ApprovalPlan, PlanStatus};
use crate::types::{
    ActorContext, InvocationStatus, TokenUsage, ToolInvocationRecord, TranscriptEntry,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Persisted per-session state used to resume a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,

    pub actor: ActorContext,

    /// Engine-assigned conversation id, once confirmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,

    #[serde(default)]
    pub total_usage: TokenUsage,

    #[serde(default)]
    pub total_cost_usd: f64,

    #[serde(default)]
    pub turn_count: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, actor: ActorContext) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            actor,
            conversation_id: None,
            total_usage: TokenUsage::default(),
            total_cost_usd: 0.0,
            turn_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Status transition for an invocation record
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationUpdate {
    pub status: InvocationStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl InvocationUpdate {
    pub fn status(status: InvocationStatus) -> Self {
        Self {
            status,
            output: None,
            error: None,
        }
    }
}

/// Storage backend for sessions, transcripts, invocation records and plans
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the persisted record for a session, if any
    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Insert or replace a session record
    async fn save_session(&self, record: &SessionRecord) -> Result<()>;

    /// Append one transcript row
    async fn append_transcript(&self, entry: &TranscriptEntry) -> Result<()>;

    /// Insert a new invocation record
    async fn insert_invocation(&self, record: &ToolInvocationRecord) -> Result<()>;

    /// Apply a status transition to an existing invocation record
    async fn update_invocation(&self, id: &str, update: InvocationUpdate) -> Result<()>;

    /// Most recent approved or executing plan for a session
    async fn load_active_plan(&self, session_id: &str) -> Result<Option<ApprovalPlan>>;

    /// Insert or replace a plan
    async fn save_plan(&self, plan: &ApprovalPlan) -> Result<()>;

    /// Update a plan's status
    async fn update_plan_status(&self, plan_id: &str, status: PlanStatus) -> Result<()>;
}

/// In-memory store
///
/// Lost on drop, but useful for embedding and tests.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    transcripts: RwLock<HashMap<String, Vec<TranscriptEntry>>>,
    invocations: RwLock<HashMap<String, ToolInvocationRecord>>,
    plans: RwLock<HashMap<String, ApprovalPlan>>,
}

fn poisoned(e: impl std::fmt::Display) -> SessionError {
    SessionError::Store(format!("Failed to acquire store lock: {}", e))
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one invocation record
    pub fn invocation(&self, id: &str) -> Option<ToolInvocationRecord> {
        self.invocations.read().ok()?.get(id).cloned()
    }

    /// All invocation records of a session, oldest first
    pub fn invocations_for_session(&self, session_id: &str) -> Vec<ToolInvocationRecord> {
        let mut records: Vec<_> = self
            .invocations
            .read()
            .map(|m| {
                m.values()
                    .filter(|r| r.session_id == session_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Transcript of a session in append order
    pub fn transcript(&self, session_id: &str) -> Vec<TranscriptEntry> {
        self.transcripts
            .read()
            .ok()
            .and_then(|m| m.get(session_id).cloned())
            .unwrap_or_default()
    }

    pub fn plan(&self, plan_id: &str) -> Option<ApprovalPlan> {
        self.plans.read().ok()?.get(plan_id).cloned()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.read().ok()?.get(session_id).cloned()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let sessions = self.sessions.read().map_err(poisoned)?;
        Ok(sessions.get(session_id).cloned())
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<()> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        let mut record = record.clone();
        record.updated_at = Utc::now();
        sessions.insert(record.id.clone(), record);
        Ok(())
    }

    async fn append_transcript(&self, entry: &TranscriptEntry) -> Result<()> {
        let mut transcripts = self.transcripts.write().map_err(poisoned)?;
        transcripts
            .entry(entry.session_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn insert_invocation(&self, record: &ToolInvocationRecord) -> Result<()> {
        let mut invocations = self.invocations.write().map_err(poisoned)?;
        invocations.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_invocation(&self, id: &str, update: InvocationUpdate) -> Result<()> {
        let mut invocations = self.invocations.write().map_err(poisoned)?;
        let record = invocations
            .get_mut(id)
            .ok_or_else(|| SessionError::Store(format!("Invocation not found: {}", id)))?;

        let now = Utc::now();
        record.status = update.status;
        record.updated_at = now;
        if update.output.is_some() {
            record.output = update.output;
        }
        if update.error.is_some() {
            record.error = update.error;
        }
        if update.status.is_terminal() {
            record.completed_at = Some(now);
        }
        Ok(())
    }

    async fn load_active_plan(&self, session_id: &str) -> Result<Option<ApprovalPlan>> {
        let plans = self.plans.read().map_err(poisoned)?;
        Ok(plans
            .values()
            .filter(|p| p.session_id == session_id)
            .filter(|p| matches!(p.status, PlanStatus::Approved | PlanStatus::Executing))
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn save_plan(&self, plan: &ApprovalPlan) -> Result<()> {
        let mut plans = self.plans.write().map_err(poisoned)?;
        plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn update_plan_status(&self, plan_id: &str, status: PlanStatus) -> Result<()> {
        let mut plans = self.plans.write().map_err(poisoned)?;
        let plan = plans
            .get_mut(plan_id)
            .ok_or_else(|| SessionError::Store(format!("Plan not found: {}", plan_id)))?;
        plan.status = status;
        Ok(())
    }
}
