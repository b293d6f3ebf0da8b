//! Tool-call audit records
//!
//! One structured record per tool call: who, what, outcome, risk tier and
//! whether a human (or a plan) approved it. The writer lives outside the core
//! behind `AuditSink`; `MemoryAuditLog` is the bounded in-process sink.

use crate::error::Result;
use crate::types::{ActorContext, RiskTier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::RwLock;

/// Outcome of an audited tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure,
    Denied,
}

/// A single audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub actor: ActorContext,
    /// Dotted action name, e.g. `agent.tool.run_script`
    pub action: String,
    pub tool_name: String,
    pub result: AuditResult,
    pub risk_tier: RiskTier,
    /// Whether the call went through an explicit or plan approval
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AuditEntry {
    pub fn tool_call(
        session_id: impl Into<String>,
        actor: ActorContext,
        tool_name: impl Into<String>,
        result: AuditResult,
        risk_tier: RiskTier,
        approved: bool,
    ) -> Self {
        let tool_name = tool_name.into();
        Self {
            timestamp: Utc::now(),
            session_id: session_id.into(),
            actor,
            action: format!("agent.tool.{}", tool_name),
            tool_name,
            result,
            risk_tier,
            approved,
            invocation_id: None,
            details: None,
        }
    }

    pub fn with_invocation(mut self, invocation_id: Option<String>) -> Self {
        self.invocation_id = invocation_id;
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<()>;
}

/// Thread-safe audit log with bounded capacity
pub struct MemoryAuditLog {
    entries: RwLock<VecDeque<AuditEntry>>,
    max_entries: usize,
}

impl MemoryAuditLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .read()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entries_for_session(&self, session_id: &str) -> Vec<AuditEntry> {
        self.entries
            .read()
            .map(|e| {
                e.iter()
                    .filter(|e| e.session_id == session_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryAuditLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        let Ok(mut entries) = self.entries.write() else {
            tracing::error!("Audit log lock poisoned, dropping audit entry");
            return Ok(());
        };
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(session_id: &str, tool: &str, result: AuditResult) -> AuditEntry {
        AuditEntry::tool_call(
            session_id,
            ActorContext::new("u1", "org1"),
            tool,
            result,
            RiskTier::Destructive,
            true,
        )
    }

    #[tokio::test]
    async fn test_record_and_filter() {
        let log = MemoryAuditLog::new(100);
        assert!(log.is_empty());

        log.record(entry("s1", "run_script", AuditResult::Success)).await.unwrap();
        log.record(entry("s2", "file_operations", AuditResult::Denied)).await.unwrap();
        log.record(entry("s1", "manage_services", AuditResult::Failure)).await.unwrap();

        assert_eq!(log.len(), 3);
        let s1 = log.entries_for_session("s1");
        assert_eq!(s1.len(), 2);
        assert_eq!(s1[0].action, "agent.tool.run_script");
        assert_eq!(s1[1].result, AuditResult::Failure);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let log = MemoryAuditLog::new(2);
        log.record(entry("s1", "a", AuditResult::Success)).await.unwrap();
        log.record(entry("s1", "b", AuditResult::Success)).await.unwrap();
        log.record(entry("s1", "c", AuditResult::Success)).await.unwrap();

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tool_name, "b");
        assert_eq!(entries[1].tool_name, "c");
    }

    #[test]
    fn test_entry_serialization() {
        let json = serde_json::to_value(
            entry("s1", "run_script", AuditResult::Denied).with_details("Rejected by operator"),
        )
        .unwrap();
        assert_eq!(json["result"], "denied");
        assert_eq!(json["riskTier"], 3);
        assert_eq!(json["actor"]["userId"], "u1");
        assert_eq!(json["details"], "Rejected by operator");
    }
}
