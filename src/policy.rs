//! Risk classification and delegated policy checks
//!
//! - `RiskClassifier` decides whether a tool exists and how risky a specific
//!   call is. Classification is input-aware: a tool's baseline tier can be
//!   escalated by the action the call requests.
//! - `PolicyChecker` answers permission and per-tool rate questions. The core
//!   only consumes the answer.
//! - `TargetInspector` gathers best-effort context shown to the approver.

use crate::error::Result;
use crate::types::{ActorContext, RiskTier};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Classifies tool calls by risk
pub trait RiskClassifier: Send + Sync {
    /// Risk tier for this call, or `None` for an unknown tool
    fn classify(&self, tool_name: &str, input: &serde_json::Value) -> Option<RiskTier>;

    /// Human-readable summary shown in approval prompts
    fn describe(&self, tool_name: &str, input: &serde_json::Value) -> String {
        match input.get("action").and_then(|v| v.as_str()) {
            Some(action) => format!("{} ({})", tool_name, action),
            None => tool_name.to_string(),
        }
    }
}

/// Input-driven tier escalation for one tool
#[derive(Debug, Clone)]
struct Escalation {
    field: String,
    values: HashSet<String>,
    tier: RiskTier,
}

#[derive(Debug, Clone)]
struct ToolRisk {
    base: RiskTier,
    escalations: Vec<Escalation>,
}

/// Static tool catalog with baseline tiers and action escalations
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: HashMap<String, ToolRisk>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool with its baseline tier
    pub fn with_tool(mut self, name: impl Into<String>, base: RiskTier) -> Self {
        self.tools.insert(
            name.into(),
            ToolRisk {
                base,
                escalations: Vec::new(),
            },
        );
        self
    }

    /// Escalate `name` to `tier` when `input[field]` is one of `values`
    ///
    /// Registers the tool at tier 1 if it is not yet known.
    pub fn with_escalation(
        mut self,
        name: &str,
        field: &str,
        values: &[&str],
        tier: RiskTier,
    ) -> Self {
        let entry = self.tools.entry(name.to_string()).or_insert(ToolRisk {
            base: RiskTier::Safe,
            escalations: Vec::new(),
        });
        entry.escalations.push(Escalation {
            field: field.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
            tier,
        });
        self
    }

    /// Fleet-management tools exposed to the assistant
    pub fn fleet() -> Self {
        Self::new()
            .with_tool("query_devices", RiskTier::Safe)
            .with_tool("get_device_details", RiskTier::Safe)
            .with_tool("analyze_metrics", RiskTier::Safe)
            .with_tool("get_active_alerts", RiskTier::Safe)
            .with_tool("query_audit_log", RiskTier::Safe)
            .with_tool("get_active_users", RiskTier::Safe)
            .with_tool("take_screenshot", RiskTier::Safe)
            .with_tool("propose_action_plan", RiskTier::Safe)
            .with_tool("execute_command", RiskTier::Destructive)
            .with_tool("run_script", RiskTier::Destructive)
            .with_tool("computer_control", RiskTier::Destructive)
            .with_escalation(
                "manage_alerts",
                "action",
                &["acknowledge", "resolve", "suppress"],
                RiskTier::Mutating,
            )
            .with_escalation(
                "manage_services",
                "action",
                &["start", "stop", "restart"],
                RiskTier::Destructive,
            )
            .with_escalation(
                "file_operations",
                "action",
                &["write", "delete", "rename"],
                RiskTier::Destructive,
            )
            .with_escalation(
                "security_scan",
                "action",
                &["quarantine", "remove", "restore"],
                RiskTier::Destructive,
            )
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl RiskClassifier for ToolCatalog {
    fn classify(&self, tool_name: &str, input: &serde_json::Value) -> Option<RiskTier> {
        let risk = self.tools.get(tool_name)?;
        let escalated = risk
            .escalations
            .iter()
            .filter(|e| {
                input
                    .get(&e.field)
                    .and_then(|v| v.as_str())
                    .is_some_and(|v| e.values.contains(v))
            })
            .map(|e| e.tier)
            .max();
        Some(escalated.map_or(risk.base, |tier| tier.max(risk.base)))
    }
}

/// Answer from a policy check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

/// Delegated permission and rate-limit decisions
#[async_trait]
pub trait PolicyChecker: Send + Sync {
    /// Whether the actor may invoke this tool with this input
    async fn check_permission(
        &self,
        tool_name: &str,
        input: &serde_json::Value,
        actor: &ActorContext,
    ) -> Result<PolicyDecision>;

    /// Whether the actor is within this tool's rate limit; counts the call when allowed
    async fn check_rate(&self, tool_name: &str, actor: &ActorContext) -> Result<PolicyDecision>;
}

/// Best-effort context about a call's target, shown to the approver
#[async_trait]
pub trait TargetInspector: Send + Sync {
    async fn inspect(
        &self,
        tool_name: &str,
        input: &serde_json::Value,
        actor: &ActorContext,
    ) -> Result<Option<serde_json::Value>>;
}

/// Deny-list plus per-actor sliding-window rate limits
#[derive(Default)]
pub struct DefaultPolicy {
    denied_tools: HashSet<String>,
    limits: HashMap<String, (usize, Duration)>,
    calls: Mutex<HashMap<(String, String), VecDeque<Instant>>>,
}

impl DefaultPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny a tool for every actor
    pub fn deny_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.denied_tools.insert(tool_name.into());
        self
    }

    /// Allow at most `max_calls` per actor within `window`
    pub fn with_rate_limit(
        mut self,
        tool_name: impl Into<String>,
        max_calls: usize,
        window: Duration,
    ) -> Self {
        self.limits.insert(tool_name.into(), (max_calls, window));
        self
    }
}

#[async_trait]
impl PolicyChecker for DefaultPolicy {
    async fn check_permission(
        &self,
        tool_name: &str,
        _input: &serde_json::Value,
        actor: &ActorContext,
    ) -> Result<PolicyDecision> {
        if self.denied_tools.contains(tool_name) {
            return Ok(PolicyDecision::Deny(format!(
                "Tool '{}' is not permitted for user {}",
                tool_name, actor.user_id
            )));
        }
        Ok(PolicyDecision::Allow)
    }

    async fn check_rate(&self, tool_name: &str, actor: &ActorContext) -> Result<PolicyDecision> {
        let Some(&(max_calls, window)) = self.limits.get(tool_name) else {
            return Ok(PolicyDecision::Allow);
        };

        let now = Instant::now();
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        let history = calls
            .entry((actor.user_id.clone(), tool_name.to_string()))
            .or_default();
        while history
            .front()
            .is_some_and(|&t| now.duration_since(t) >= window)
        {
            history.pop_front();
        }

        if history.len() >= max_calls {
            return Ok(PolicyDecision::Deny(format!(
                "Rate limit exceeded for '{}': at most {} calls per {}s",
                tool_name,
                max_calls,
                window.as_secs()
            )));
        }
        history.push_back(now);
        Ok(PolicyDecision::Allow)
    }
}
