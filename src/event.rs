//! Session event vocabulary
//!
//! Every observable occurrence in a session is one variant of [`SessionEvent`].
//! Events are immutable once published; the bus wraps them in an
//! [`EventEnvelope`] carrying the session-scoped sequence number.

use crate::plan::PlanStatus;
use crate::types::{RiskTier, TokenUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of an `error` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The engine stopped because the session budget ran out
    BudgetExceeded,
    /// The engine stopped because it hit its turn limit
    TurnLimitExceeded,
    /// The per-turn timer fired before a terminal result arrived
    TurnTimeout,
    /// The registry evicted the session (idle, age or capacity)
    SessionEvicted,
    /// The engine output stream failed
    Engine,
    /// Any other terminal error reported by the engine
    Generic,
}

/// Events published on a session's event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A new assistant message started streaming
    MessageStart { message_id: String },

    /// Incremental assistant text
    ContentDelta { text: String },

    /// The current assistant message finished streaming
    #[serde(rename_all = "camelCase")]
    MessageEnd {
        message_id: String,
        usage: TokenUsage,
    },

    /// The engine announced a tool invocation
    #[serde(rename_all = "camelCase")]
    ToolUseStart {
        tool_use_id: String,
        tool_name: String,
        input: serde_json::Value,
    },

    /// A tool invocation finished (or was never observed finishing)
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_use_id: String,
        tool_name: String,
        output: serde_json::Value,
        is_error: bool,
    },

    /// A gated tool call is waiting for a human decision
    #[serde(rename_all = "camelCase")]
    ApprovalRequired {
        execution_id: String,
        tool_name: String,
        input: serde_json::Value,
        risk_tier: RiskTier,
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<serde_json::Value>,
        timeout_ms: u64,
    },

    /// A pre-approved plan step matched and is executing
    #[serde(rename_all = "camelCase")]
    PlanStepStart {
        plan_id: String,
        step_index: usize,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },

    /// A pre-approved plan step finished
    #[serde(rename_all = "camelCase")]
    PlanStepComplete {
        plan_id: String,
        step_index: usize,
        tool_name: String,
        success: bool,
    },

    /// Visual verification captured after a plan step
    #[serde(rename_all = "camelCase")]
    PlanScreenshot {
        plan_id: String,
        step_index: usize,
        image_base64: String,
    },

    /// A plan finished or was aborted
    #[serde(rename_all = "camelCase")]
    PlanComplete { plan_id: String, status: PlanStatus },

    /// Human-readable failure
    Error { kind: ErrorKind, message: String },

    /// The current turn is over
    #[serde(rename_all = "camelCase")]
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<f64>,
    },
}

impl SessionEvent {
    /// Shorthand for an error event
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        SessionEvent::Error {
            kind,
            message: message.into(),
        }
    }

    /// Turn-complete event without usage
    pub fn done() -> Self {
        SessionEvent::Done {
            usage: None,
            total_cost_usd: None,
        }
    }

    /// Wire name of this event's variant
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::MessageStart { .. } => "message_start",
            SessionEvent::ContentDelta { .. } => "content_delta",
            SessionEvent::MessageEnd { .. } => "message_end",
            SessionEvent::ToolUseStart { .. } => "tool_use_start",
            SessionEvent::ToolResult { .. } => "tool_result",
            SessionEvent::ApprovalRequired { .. } => "approval_required",
            SessionEvent::PlanStepStart { .. } => "plan_step_start",
            SessionEvent::PlanStepComplete { .. } => "plan_step_complete",
            SessionEvent::PlanScreenshot { .. } => "plan_screenshot",
            SessionEvent::PlanComplete { .. } => "plan_complete",
            SessionEvent::Error { .. } => "error",
            SessionEvent::Done { .. } => "done",
        }
    }
}

/// A published event with its position in the session's stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Zero-based publish order within the session
    pub sequence: u64,

    /// When the event was published
    pub timestamp: DateTime<Utc>,

    /// The event itself
    pub event: SessionEvent,
}
