//! Model-query engine contract
//!
//! The core never talks to a model directly. A [`QueryEngineFactory`] starts
//! one engine per session, handing it the session's input feed and a
//! [`ToolHooks`] gate. The engine answers with an [`EngineHandle`]: a lazy
//! stream of [`EngineMessage`] items plus an [`EngineControl`] for interrupt
//! and shutdown.
//!
//! ## Ordering contract
//!
//! - A `ToolUse` announcement is yielded before the engine calls
//!   [`ToolHooks::pre_tool_use`] for that call, and the hook is only invoked
//!   while the output stream is being polled again. The processor therefore
//!   always registers the correlation id before the gate sees the call.
//! - `post_tool_use` is called exactly once for every call the gate allowed
//!   and never for a denied call.
//! - Every turn started by a user message ends with exactly one `Result`.

use crate::error::Result;
use crate::input::InputFeed;
use crate::types::{RiskTier, TokenUsage};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Streamed fragment of the assistant message currently being generated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fragment {
    #[serde(rename_all = "camelCase")]
    MessageStart { message_id: String },
    TextDelta { text: String },
    /// Usage reported so far for the current message
    MessageDelta { usage: TokenUsage },
    MessageStop,
}

/// One block of a complete assistant turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", content = "message", rename_all = "snake_case")]
pub enum TurnOutcome {
    Success,
    ErrorMaxBudget,
    ErrorMaxTurns,
    Error(String),
}

/// Terminal item of a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResult {
    pub outcome: TurnOutcome,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl TurnResult {
    pub fn success(usage: TokenUsage, total_cost_usd: f64) -> Self {
        Self {
            outcome: TurnOutcome::Success,
            usage,
            total_cost_usd,
            num_turns: 1,
            text: None,
        }
    }

    pub fn failed(outcome: TurnOutcome) -> Self {
        Self {
            outcome,
            usage: TokenUsage::default(),
            total_cost_usd: 0.0,
            num_turns: 1,
            text: None,
        }
    }
}

/// Items produced by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    /// Startup confirmed; carries the engine-assigned conversation id
    Ready { conversation_id: String },

    /// Streaming fragment of the current assistant message
    Fragment(Fragment),

    /// The engine is about to invoke a tool
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// A complete assistant turn, for the transcript
    Assistant {
        message_id: String,
        content: Vec<ContentBlock>,
    },

    /// The turn is over
    Result(TurnResult),
}

/// Output side of a running engine
pub type EngineOutput = BoxStream<'static, Result<EngineMessage>>;

/// Out-of-band control of a running engine
#[async_trait]
pub trait EngineControl: Send + Sync {
    /// Ask the engine to stop the current turn
    async fn interrupt(&self) -> Result<()>;

    /// Shut the engine down; the output stream ends afterwards
    async fn close(&self) -> Result<()>;
}

/// Everything an engine needs to serve one session
pub struct EngineRequest {
    pub session_id: String,
    pub input: InputFeed,
    pub system_prompt: Option<String>,
    /// Tools the engine may offer; empty means every tool the gate knows
    pub allowed_tools: Vec<String>,
    pub max_budget_usd: Option<f64>,
    /// Conversation to resume, when the session was persisted before
    pub resume_conversation_id: Option<String>,
    pub hooks: Arc<dyn ToolHooks>,
}

/// A started engine
pub struct EngineHandle {
    pub control: Arc<dyn EngineControl>,
    pub output: EngineOutput,
}

/// Starts engines for new sessions
pub trait QueryEngineFactory: Send + Sync {
    fn start(&self, request: EngineRequest) -> Result<EngineHandle>;
}

/// Permission to run one tool call, carried from the pre-hook to the post-hook
#[derive(Debug, Clone, PartialEq)]
pub struct ToolTicket {
    pub tool_name: String,
    pub input: serde_json::Value,
    pub risk_tier: RiskTier,
    /// Invocation record created while gating, if any
    pub invocation_id: Option<String>,
    /// Whether a human, a plan, or the session mode approved the call
    pub approved: bool,
    /// Plan step this call consumed
    pub plan_step: Option<usize>,
}

/// Answer of the pre-tool hook
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Allow(ToolTicket),
    Deny { reason: String },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow(_))
    }

    pub fn deny_reason(&self) -> Option<&str> {
        match self {
            GateDecision::Deny { reason } => Some(reason),
            GateDecision::Allow(_) => None,
        }
    }
}

/// Output of an executed tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub output: serde_json::Value,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(output: serde_json::Value) -> Self {
        Self {
            output,
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: serde_json::Value::String(message.into()),
            is_error: true,
        }
    }
}

/// Gate the engine calls around every tool execution
#[async_trait]
pub trait ToolHooks: Send + Sync {
    /// Decide whether the call may run; may block on human approval
    async fn pre_tool_use(&self, tool_name: &str, input: &serde_json::Value) -> GateDecision;

    /// Bookkeeping after an allowed call ran
    async fn post_tool_use(&self, ticket: ToolTicket, output: ToolOutput);
}
