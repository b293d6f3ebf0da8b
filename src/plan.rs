//! Pre-approved action plans
//!
//! A plan is an ordered list of expected tool calls that a human approved up
//! front. While it is active, a gated call that matches the next expected step
//! passes the approval gate without a prompt.

use crate::error::{Result, SessionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Input fields compared when matching a call against a plan step
///
/// Fields outside this set (timeouts, free-text reasons, ...) may differ
/// between the approved step and the actual call.
pub const PLAN_KEY_FIELDS: &[&str] = &[
    "target",
    "deviceId",
    "deviceIds",
    "action",
    "path",
    "serviceName",
    "scriptId",
    "alertId",
    "command",
];

/// Storage status of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Approved,
    Executing,
    Completed,
    Aborted,
}

/// One expected tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub tool_name: String,

    #[serde(default)]
    pub input: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PlanStep {
    pub fn new(tool_name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            input,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether a call matches this step on tool name and key fields
    pub fn matches(&self, tool_name: &str, input: &serde_json::Value) -> bool {
        if self.tool_name != tool_name {
            return false;
        }
        PLAN_KEY_FIELDS
            .iter()
            .all(|field| self.input.get(field) == input.get(field))
    }
}

/// An ordered, human-approved sequence of expected tool calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalPlan {
    /// Plan identifier (plan-<uuid>)
    pub id: String,
    pub session_id: String,
    pub steps: Vec<PlanStep>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
}

impl ApprovalPlan {
    /// Create an approved plan with a fresh id
    pub fn new(session_id: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            id: format!("plan-{}", uuid::Uuid::new_v4()),
            session_id: session_id.into(),
            steps,
            status: PlanStatus::Approved,
            created_at: Utc::now(),
        }
    }

    /// Reject plans that can never be matched
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(SessionError::InvalidPlan(format!(
                "plan {} has no steps",
                self.id
            )));
        }
        for (index, step) in self.steps.iter().enumerate() {
            if step.tool_name.trim().is_empty() {
                return Err(SessionError::InvalidPlan(format!(
                    "plan {} step {} has no tool name",
                    self.id, index
                )));
            }
            if !(step.input.is_object() || step.input.is_null()) {
                return Err(SessionError::InvalidPlan(format!(
                    "plan {} step {} input must be an object",
                    self.id, index
                )));
            }
        }
        Ok(())
    }
}

/// Progress of the plan a session is currently executing
#[derive(Debug, Clone)]
pub struct ActivePlan {
    plan: ApprovalPlan,
    next_index: usize,
    in_flight: VecDeque<usize>,
    completed: usize,
}

impl ActivePlan {
    /// Start tracking a validated plan
    pub fn new(plan: ApprovalPlan) -> Result<Self> {
        plan.validate()?;
        Ok(Self {
            plan,
            next_index: 0,
            in_flight: VecDeque::new(),
            completed: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.plan.id
    }

    pub fn plan(&self) -> &ApprovalPlan {
        &self.plan
    }

    /// Index of the next expected step (equals the step count when exhausted)
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn step(&self, index: usize) -> Option<&PlanStep> {
        self.plan.steps.get(index)
    }

    /// Consume the next step if the call matches it
    pub fn try_advance(&mut self, tool_name: &str, input: &serde_json::Value) -> Option<usize> {
        let index = self.next_index;
        let step = self.plan.steps.get(index)?;
        if !step.matches(tool_name, input) {
            return None;
        }
        self.next_index += 1;
        self.in_flight.push_back(index);
        Some(index)
    }

    /// Mark the oldest in-flight step for this tool as finished
    pub fn complete_step(&mut self, tool_name: &str) -> Option<usize> {
        let position = self
            .in_flight
            .iter()
            .position(|&i| self.plan.steps[i].tool_name == tool_name)?;
        let index = self.in_flight.remove(position)?;
        self.completed += 1;
        Some(index)
    }

    /// Every approved step has been consumed and finished
    pub fn is_complete(&self) -> bool {
        self.completed >= self.plan.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_step_plan() -> ApprovalPlan {
        ApprovalPlan::new(
            "s1",
            vec![
                PlanStep::new("toolA", json!({"target": "x"})),
                PlanStep::new("toolB", json!({"target": "y"})),
            ],
        )
    }

    #[test]
    fn test_step_matching_uses_key_fields_only() {
        let step = PlanStep::new(
            "manage_services",
            json!({"deviceId": "d1", "action": "restart", "serviceName": "nginx"}),
        );
        assert!(step.matches(
            "manage_services",
            &json!({"deviceId": "d1", "action": "restart", "serviceName": "nginx", "reason": "stuck"})
        ));
        assert!(!step.matches(
            "manage_services",
            &json!({"deviceId": "d2", "action": "restart", "serviceName": "nginx"})
        ));
        assert!(!step.matches(
            "run_script",
            &json!({"deviceId": "d1", "action": "restart", "serviceName": "nginx"})
        ));
    }

    #[test]
    fn test_advance_in_order() {
        let mut active = ActivePlan::new(two_step_plan()).unwrap();

        assert_eq!(active.try_advance("toolA", &json!({"target": "x"})), Some(0));
        assert_eq!(active.next_index(), 1);

        // Out-of-order call does not match
        assert_eq!(active.try_advance("toolC", &json!({"target": "y"})), None);
        assert_eq!(active.next_index(), 1);

        assert_eq!(active.try_advance("toolB", &json!({"target": "y"})), Some(1));
        assert_eq!(active.next_index(), 2);

        // Exhausted plans never advance past the step count
        assert_eq!(active.try_advance("toolB", &json!({"target": "y"})), None);
        assert_eq!(active.next_index(), 2);
    }

    #[test]
    fn test_completion_requires_every_step_finished() {
        let mut active = ActivePlan::new(two_step_plan()).unwrap();
        active.try_advance("toolA", &json!({"target": "x"}));
        assert_eq!(active.complete_step("toolA"), Some(0));
        assert!(!active.is_complete());

        active.try_advance("toolB", &json!({"target": "y"}));
        assert_eq!(active.complete_step("toolZ"), None);
        assert_eq!(active.complete_step("toolB"), Some(1));
        assert!(active.is_complete());
    }

    #[test]
    fn test_malformed_plans_rejected() {
        let empty = ApprovalPlan::new("s1", vec![]);
        assert!(matches!(
            ActivePlan::new(empty),
            Err(SessionError::InvalidPlan(_))
        ));

        let nameless = ApprovalPlan::new("s1", vec![PlanStep::new(" ", json!({}))]);
        assert!(nameless.validate().is_err());

        let scalar_input = ApprovalPlan::new("s1", vec![PlanStep::new("toolA", json!(5))]);
        assert!(scalar_input.validate().is_err());
    }

    #[test]
    fn test_plan_serialization() {
        let plan = two_step_plan();
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["status"], "approved");
        assert_eq!(json["steps"][0]["toolName"], "toolA");
        assert!(plan.id.starts_with("plan-"));
    }
}
