//! Core data types shared across the session core
//!
//! All types use camelCase JSON serialization for wire compatibility with the
//! HTTP layer that relays them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Risk tier of a tool invocation
///
/// Serialized as its numeric value (1, 2, 3). Tier 2 and above is gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RiskTier {
    /// Read-only queries
    Safe = 1,
    /// State-changing but recoverable operations
    Mutating = 2,
    /// Destructive or irreversible operations
    Destructive = 3,
}

impl RiskTier {
    /// Numeric tier value
    pub fn level(self) -> u8 {
        self as u8
    }

    /// Whether calls at this tier must pass the approval gate
    pub fn requires_gate(self) -> bool {
        self >= RiskTier::Mutating
    }
}

impl From<RiskTier> for u8 {
    fn from(tier: RiskTier) -> Self {
        tier.level()
    }
}

impl TryFrom<u8> for RiskTier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RiskTier::Safe),
            2 => Ok(RiskTier::Mutating),
            3 => Ok(RiskTier::Destructive),
            other => Err(format!("invalid risk tier: {}", other)),
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier {}", self.level())
    }
}

/// How gated (tier >= 2) tool calls are approved for a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Every gated call waits for a human decision
    #[default]
    PerStep,
    /// Gated calls matching the active plan pass; others fall back to per-step
    ActionPlan,
    /// Gated calls pass without a prompt
    AutoApprove,
    /// Like `ActionPlan`, with screenshot verification events after each step
    HybridPlan,
}

impl ApprovalMode {
    /// Whether this mode consults the active approval plan
    pub fn uses_plan(self) -> bool {
        matches!(self, ApprovalMode::ActionPlan | ApprovalMode::HybridPlan)
    }
}

/// Authenticated actor and organization context for a session
///
/// Refreshed on every request that reuses the session so audit records carry
/// the most recent request metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorContext {
    /// Authenticated user id
    pub user_id: String,

    /// Organization the session operates in
    pub org_id: String,

    /// Client IP of the most recent request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    /// Correlation id of the most recent request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ActorContext {
    /// Create an actor context for a user within an organization
    pub fn new(user_id: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            org_id: org_id.into(),
            ip_address: None,
            request_id: None,
        }
    }
}

/// Token usage reported by the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl TokenUsage {
    /// Accumulate another usage report into this one
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Lifecycle status of a tool invocation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// Waiting for a human decision
    Pending,
    /// Allowed and handed to the executor
    Executing,
    /// Executed successfully
    Completed,
    /// Executed with an error
    Failed,
    /// Explicitly rejected by a human
    Rejected,
}

impl InvocationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvocationStatus::Completed | InvocationStatus::Failed | InvocationStatus::Rejected
        )
    }
}

/// One gated or ungated tool call, as persisted outside the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationRecord {
    /// Record identifier (inv-<uuid>); also the approval correlation id
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    /// Risk tier at evaluation time
    pub risk_tier: RiskTier,
    pub status: InvocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ToolInvocationRecord {
    /// Create a record with a fresh id
    pub fn new(
        session_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: serde_json::Value,
        risk_tier: RiskTier,
        status: InvocationStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("inv-{}", uuid::Uuid::new_v4()),
            session_id: session_id.into(),
            tool_name: tool_name.into(),
            input,
            risk_tier,
            status,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: if status.is_terminal() { Some(now) } else { None },
        }
    }
}

/// Role of a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Assistant,
    ToolUse,
    ToolResult,
}

/// One persisted transcript row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub session_id: String,
    pub role: TranscriptRole,
    /// Text for user/assistant rows, structured input/output for tool rows
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn new(session_id: impl Into<String>, role: TranscriptRole, content: serde_json::Value) -> Self {
        Self {
            session_id: session_id.into(),
            role,
            content,
            tool_name: None,
            tool_use_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>, tool_use_id: Option<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self.tool_use_id = tool_use_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_tier_serializes_as_number() {
        assert_eq!(serde_json::to_string(&RiskTier::Destructive).unwrap(), "3");
        let tier: RiskTier = serde_json::from_str("2").unwrap();
        assert_eq!(tier, RiskTier::Mutating);
        assert!(serde_json::from_str::<RiskTier>("7").is_err());
    }

    #[test]
    fn test_risk_tier_gate_threshold() {
        assert!(!RiskTier::Safe.requires_gate());
        assert!(RiskTier::Mutating.requires_gate());
        assert!(RiskTier::Destructive.requires_gate());
        assert!(RiskTier::Safe < RiskTier::Destructive);
    }

    #[test]
    fn test_approval_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&ApprovalMode::HybridPlan).unwrap(),
            "\"hybrid_plan\""
        );
        let mode: ApprovalMode = serde_json::from_str("\"auto_approve\"").unwrap();
        assert_eq!(mode, ApprovalMode::AutoApprove);
        assert!(ApprovalMode::ActionPlan.uses_plan());
        assert!(!ApprovalMode::PerStep.uses_plan());
    }

    #[test]
    fn test_token_usage_accumulates() {
        let mut total = TokenUsage::default();
        total.add(&TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        });
        total.add(&TokenUsage {
            input_tokens: 1,
            output_tokens: 2,
            cache_read_input_tokens: 3,
            ..Default::default()
        });
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.output_tokens, 7);
        assert_eq!(total.cache_read_input_tokens, 3);
        assert_eq!(total.total(), 18);
    }

    #[test]
    fn test_invocation_record_ids_and_terminal_timestamps() {
        let pending = ToolInvocationRecord::new(
            "s1",
            "run_script",
            serde_json::json!({"deviceId": "d1"}),
            RiskTier::Destructive,
            InvocationStatus::Pending,
        );
        assert!(pending.id.starts_with("inv-"));
        assert!(pending.completed_at.is_none());

        let done = ToolInvocationRecord::new(
            "s1",
            "query_devices",
            serde_json::json!({}),
            RiskTier::Safe,
            InvocationStatus::Completed,
        );
        assert!(done.completed_at.is_some());
        assert_ne!(pending.id, done.id);
    }
}
