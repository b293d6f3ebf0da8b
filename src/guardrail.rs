//! Tool-risk guardrail and approval gate
//!
//! Every tool call the engine wants to make passes [`Guardrail::pre_tool_use`]:
//!
//! 1. Unknown tools (not classified, or not admitted by the session) are denied.
//! 2. The classifier assigns an input-aware risk tier.
//! 3. Delegated permission and rate checks run; any failure denies.
//! 4. Tier 1 calls pass immediately.
//! 5. Tier 2+ calls are approved by the session's effective mode:
//!    auto-approve, a matching plan step, or a blocking per-step human decision.
//!
//! Allowed calls come back through [`Guardrail::post_tool_use`] for
//! transcript, invocation-record, plan and audit bookkeeping. Each call yields
//! exactly one audit record, denied or not.

use crate::approval::{ApprovalGate, ApprovalOutcome};
use crate::audit::{AuditEntry, AuditResult, AuditSink};
use crate::config::GuardrailConfig;
use crate::engine::{GateDecision, ToolHooks, ToolOutput, ToolTicket};
use crate::error::{Result, SessionError};
use crate::event::SessionEvent;
use crate::plan::{ActivePlan, ApprovalPlan, PlanStatus, PlanStep};
use crate::policy::{PolicyChecker, PolicyDecision, RiskClassifier, TargetInspector};
use crate::session::Session;
use crate::store::{InvocationUpdate, SessionStore};
use crate::types::{
    ApprovalMode, InvocationStatus, RiskTier, ToolInvocationRecord, TranscriptEntry,
    TranscriptRole,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Shared gate used by every session of a registry
pub struct Guardrail {
    classifier: Arc<dyn RiskClassifier>,
    policy: Arc<dyn PolicyChecker>,
    inspector: Option<Arc<dyn TargetInspector>>,
    store: Arc<dyn SessionStore>,
    audit: Arc<dyn AuditSink>,
    approvals: ApprovalGate,
    approval_timeout: Duration,
}

impl Guardrail {
    pub fn new(
        classifier: Arc<dyn RiskClassifier>,
        policy: Arc<dyn PolicyChecker>,
        store: Arc<dyn SessionStore>,
        audit: Arc<dyn AuditSink>,
        config: &GuardrailConfig,
    ) -> Self {
        Self {
            classifier,
            policy,
            inspector: None,
            store,
            audit,
            approvals: ApprovalGate::new(),
            approval_timeout: config.approval_timeout(),
        }
    }

    /// Attach a target inspector for approval-prompt context
    pub fn with_inspector(mut self, inspector: Arc<dyn TargetInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn approval_timeout(&self) -> Duration {
        self.approval_timeout
    }

    /// Deliver a human decision for a pending invocation
    pub fn resolve_approval(&self, execution_id: &str, approved: bool) -> bool {
        let resolved = self.approvals.resolve(execution_id, approved);
        tracing::info!(
            execution_id = %execution_id,
            approved = approved,
            resolved = resolved,
            "Approval decision received"
        );
        resolved
    }

    pub fn pending_approvals(&self) -> usize {
        self.approvals.pending_count()
    }

    // ========================================================================
    // Pre-tool hook
    // ========================================================================

    /// Decide whether `tool_name` may run with `input` in `session`
    pub async fn pre_tool_use(
        &self,
        session: &Session,
        tool_name: &str,
        input: &serde_json::Value,
    ) -> GateDecision {
        let span = tracing::info_span!(
            "a3s.guardrail.pre_tool_use",
            a3s.session.id = %session.id(),
            a3s.tool.name = %tool_name,
            a3s.tool.risk_tier = tracing::field::Empty,
        );
        self.evaluate(session, tool_name, input)
            .instrument(span)
            .await
    }

    async fn evaluate(
        &self,
        session: &Session,
        tool_name: &str,
        input: &serde_json::Value,
    ) -> GateDecision {
        let tier = match self.classifier.classify(tool_name, input) {
            Some(tier) if session.allows_tool(tool_name) => tier,
            _ => {
                let reason = format!("Unknown tool: {}", tool_name);
                return self
                    .deny(session, tool_name, RiskTier::Destructive, None, reason)
                    .await;
            }
        };
        tracing::Span::current().record("a3s.tool.risk_tier", tier.level() as i64);

        let actor = session.actor();
        let permission = self.policy.check_permission(tool_name, input, &actor).await;
        if let Some(reason) = denial_reason("Permission check", permission) {
            return self.deny(session, tool_name, tier, None, reason).await;
        }
        let rate = self.policy.check_rate(tool_name, &actor).await;
        if let Some(reason) = denial_reason("Rate limit check", rate) {
            return self.deny(session, tool_name, tier, None, reason).await;
        }

        if !tier.requires_gate() {
            tracing::debug!("Tier 1 tool allowed");
            return GateDecision::Allow(ticket(tool_name, input, tier, None, false, None));
        }

        let mode = session.effective_approval_mode();
        match mode {
            ApprovalMode::AutoApprove => {
                let invocation_id = self
                    .insert_record(session, tool_name, input, tier, InvocationStatus::Executing)
                    .await;
                tracing::info!("Gated tool auto-approved by session mode");
                return GateDecision::Allow(ticket(tool_name, input, tier, invocation_id, true, None));
            }
            ApprovalMode::ActionPlan | ApprovalMode::HybridPlan => {
                if let Some(matched) = session.advance_plan(tool_name, input) {
                    return self
                        .allow_plan_step(session, tool_name, input, tier, matched)
                        .await;
                }
                tracing::debug!("Call does not match the next plan step, asking per step");
            }
            ApprovalMode::PerStep => {}
        }

        self.await_approval(session, tool_name, input, tier).await
    }

    async fn allow_plan_step(
        &self,
        session: &Session,
        tool_name: &str,
        input: &serde_json::Value,
        tier: RiskTier,
        matched: crate::session::PlanStepMatch,
    ) -> GateDecision {
        if matched.step_index == 0 {
            if let Err(e) = self
                .store
                .update_plan_status(&matched.plan_id, PlanStatus::Executing)
                .await
            {
                tracing::warn!(plan_id = %matched.plan_id, error = %e, "Failed to mark plan executing");
            }
        }
        session.events().publish(SessionEvent::PlanStepStart {
            plan_id: matched.plan_id.clone(),
            step_index: matched.step_index,
            tool_name: tool_name.to_string(),
            description: matched.description,
        });
        let invocation_id = self
            .insert_record(session, tool_name, input, tier, InvocationStatus::Executing)
            .await;
        tracing::info!(
            plan_id = %matched.plan_id,
            step_index = matched.step_index,
            "Gated tool approved by plan step"
        );
        GateDecision::Allow(ticket(
            tool_name,
            input,
            tier,
            invocation_id,
            true,
            Some(matched.step_index),
        ))
    }

    async fn await_approval(
        &self,
        session: &Session,
        tool_name: &str,
        input: &serde_json::Value,
        tier: RiskTier,
    ) -> GateDecision {
        let record = ToolInvocationRecord::new(
            session.id(),
            tool_name,
            input.clone(),
            tier,
            InvocationStatus::Pending,
        );
        if let Err(e) = self.store.insert_invocation(&record).await {
            tracing::error!(error = %e, "Failed to persist pending approval record");
            let reason = format!(
                "Approval for {} could not be recorded, refusing to run it",
                tool_name
            );
            return self.deny(session, tool_name, tier, None, reason).await;
        }

        let context = self.inspect(session, tool_name, input).await;
        let pending = self.approvals.register(&record.id);
        session.events().publish(SessionEvent::ApprovalRequired {
            execution_id: record.id.clone(),
            tool_name: tool_name.to_string(),
            input: input.clone(),
            risk_tier: tier,
            description: self.classifier.describe(tool_name, input),
            context,
            timeout_ms: self.approval_timeout.as_millis() as u64,
        });
        tracing::info!(execution_id = %record.id, "Waiting for approval");

        let cancel = session.turn_token();
        let outcome = pending.wait(self.approval_timeout, &cancel).await;
        tracing::info!(execution_id = %record.id, outcome = ?outcome, "Approval wait finished");

        let invocation_id = Some(record.id.clone());
        match outcome {
            ApprovalOutcome::Approved => {
                self.update_record(&record.id, InvocationUpdate::status(InvocationStatus::Executing))
                    .await;
                GateDecision::Allow(ticket(tool_name, input, tier, invocation_id, true, None))
            }
            ApprovalOutcome::Rejected => {
                self.update_record(
                    &record.id,
                    InvocationUpdate {
                        status: InvocationStatus::Rejected,
                        output: None,
                        error: Some("Rejected by operator".to_string()),
                    },
                )
                .await;
                let reason = format!("{} was rejected by the operator", tool_name);
                self.deny(session, tool_name, tier, invocation_id, reason).await
            }
            ApprovalOutcome::TimedOut => {
                // The record stays pending; nobody approved it.
                let reason = format!(
                    "Approval for {} timed out after {} seconds",
                    tool_name,
                    self.approval_timeout.as_secs()
                );
                self.deny(session, tool_name, tier, invocation_id, reason).await
            }
            ApprovalOutcome::Cancelled => {
                self.update_record(
                    &record.id,
                    InvocationUpdate {
                        status: InvocationStatus::Failed,
                        output: None,
                        error: Some("Approval cancelled".to_string()),
                    },
                )
                .await;
                let reason = format!("Approval for {} was cancelled", tool_name);
                self.deny(session, tool_name, tier, invocation_id, reason).await
            }
        }
    }

    async fn inspect(
        &self,
        session: &Session,
        tool_name: &str,
        input: &serde_json::Value,
    ) -> Option<serde_json::Value> {
        let inspector = self.inspector.as_ref()?;
        match inspector.inspect(tool_name, input, &session.actor()).await {
            Ok(context) => context,
            Err(e) => {
                tracing::debug!(error = %e, "Target inspection failed, continuing without context");
                None
            }
        }
    }

    /// Deny a call: audit it and close its announced tool-use slot
    async fn deny(
        &self,
        session: &Session,
        tool_name: &str,
        tier: RiskTier,
        invocation_id: Option<String>,
        reason: String,
    ) -> GateDecision {
        tracing::warn!(reason = %reason, "Tool call denied");

        let tool_use_id = session
            .pop_tool_use()
            .map(|p| p.tool_use_id)
            .unwrap_or_else(untracked_tool_use_id);
        session.events().publish(SessionEvent::ToolResult {
            tool_use_id,
            tool_name: tool_name.to_string(),
            output: serde_json::Value::String(reason.clone()),
            is_error: true,
        });

        let entry = AuditEntry::tool_call(
            session.id(),
            session.actor(),
            tool_name,
            AuditResult::Denied,
            tier,
            false,
        )
        .with_invocation(invocation_id)
        .with_details(reason.clone());
        self.record_audit(entry).await;

        GateDecision::Deny { reason }
    }

    // ========================================================================
    // Post-tool hook
    // ========================================================================

    /// Bookkeeping after an allowed call ran
    pub async fn post_tool_use(&self, session: &Session, ticket: ToolTicket, output: ToolOutput) {
        let span = tracing::info_span!(
            "a3s.guardrail.post_tool_use",
            a3s.session.id = %session.id(),
            a3s.tool.name = %ticket.tool_name,
            a3s.tool.success = !output.is_error,
        );
        self.finalize(session, ticket, output).instrument(span).await
    }

    async fn finalize(&self, session: &Session, ticket: ToolTicket, output: ToolOutput) {
        let tool_use_id = session
            .pop_tool_use()
            .map(|p| p.tool_use_id)
            .unwrap_or_else(untracked_tool_use_id);

        let entry = TranscriptEntry::new(
            session.id(),
            TranscriptRole::ToolResult,
            serde_json::json!({
                "input": ticket.input,
                "output": output.output,
                "isError": output.is_error,
            }),
        )
        .with_tool(&ticket.tool_name, Some(tool_use_id.clone()));
        if let Err(e) = self.store.append_transcript(&entry).await {
            tracing::warn!(error = %e, "Failed to persist tool result transcript");
        }

        let (status, error) = if output.is_error {
            (InvocationStatus::Failed, output.output.as_str().map(str::to_string))
        } else {
            (InvocationStatus::Completed, None)
        };
        match &ticket.invocation_id {
            Some(id) => {
                self.update_record(
                    id,
                    InvocationUpdate {
                        status,
                        output: Some(output.output.clone()),
                        error,
                    },
                )
                .await
            }
            None => {
                let mut record = ToolInvocationRecord::new(
                    session.id(),
                    &ticket.tool_name,
                    ticket.input.clone(),
                    ticket.risk_tier,
                    status,
                );
                record.output = Some(output.output.clone());
                record.error = error;
                if let Err(e) = self.store.insert_invocation(&record).await {
                    tracing::warn!(error = %e, "Failed to persist invocation record");
                }
            }
        }

        session.events().publish(SessionEvent::ToolResult {
            tool_use_id,
            tool_name: ticket.tool_name.clone(),
            output: output.output.clone(),
            is_error: output.is_error,
        });

        if ticket.plan_step.is_some() {
            self.finish_plan_step(session, &ticket.tool_name, &output).await;
        }

        let result = if output.is_error {
            AuditResult::Failure
        } else {
            AuditResult::Success
        };
        let entry = AuditEntry::tool_call(
            session.id(),
            session.actor(),
            &ticket.tool_name,
            result,
            ticket.risk_tier,
            ticket.approved,
        )
        .with_invocation(ticket.invocation_id);
        self.record_audit(entry).await;
    }

    async fn finish_plan_step(&self, session: &Session, tool_name: &str, output: &ToolOutput) {
        let Some(progress) = session.complete_plan_step(tool_name) else {
            return;
        };

        session.events().publish(SessionEvent::PlanStepComplete {
            plan_id: progress.plan_id.clone(),
            step_index: progress.step_index,
            tool_name: tool_name.to_string(),
            success: !output.is_error,
        });

        if session.approval_mode() == ApprovalMode::HybridPlan {
            if let Some(image) = screenshot_of(&output.output) {
                session.events().publish(SessionEvent::PlanScreenshot {
                    plan_id: progress.plan_id.clone(),
                    step_index: progress.step_index,
                    image_base64: image.to_string(),
                });
            }
        }

        if progress.plan_finished && session.take_plan_if(&progress.plan_id).is_some() {
            self.close_plan(session, &progress.plan_id, PlanStatus::Completed)
                .await;
        }
    }

    // ========================================================================
    // Plans
    // ========================================================================

    /// Make `steps` the session's active plan; an existing plan is aborted
    pub async fn activate_plan(&self, session: &Session, steps: Vec<PlanStep>) -> Result<String> {
        let plan = ApprovalPlan::new(session.id(), steps);
        self.install_plan(session, plan).await
    }

    /// Install an already-approved plan (e.g. restored from storage)
    pub async fn install_plan(&self, session: &Session, plan: ApprovalPlan) -> Result<String> {
        let active = ActivePlan::new(plan)?;
        let plan_id = active.id().to_string();

        self.store.save_plan(active.plan()).await.map_err(|e| {
            SessionError::Store(format!("Failed to persist plan {}: {}", plan_id, e))
        })?;

        if let Some(previous) = session.replace_plan(active) {
            tracing::info!(
                session_id = %session.id(),
                plan_id = %previous.id(),
                "Replacing active plan"
            );
            self.close_plan(session, previous.id(), PlanStatus::Aborted)
                .await;
        }
        tracing::info!(
            session_id = %session.id(),
            plan_id = %plan_id,
            "Approval plan activated"
        );
        Ok(plan_id)
    }

    /// Abort the active plan, if any; returns its id
    pub async fn abort_plan(&self, session: &Session) -> Option<String> {
        let plan = session.take_plan()?;
        let plan_id = plan.id().to_string();
        tracing::info!(
            session_id = %session.id(),
            plan_id = %plan_id,
            next_index = plan.next_index(),
            "Approval plan aborted"
        );
        self.close_plan(session, &plan_id, PlanStatus::Aborted).await;
        Some(plan_id)
    }

    async fn close_plan(&self, session: &Session, plan_id: &str, status: PlanStatus) {
        if let Err(e) = self.store.update_plan_status(plan_id, status).await {
            tracing::warn!(plan_id = %plan_id, error = %e, "Failed to persist plan status");
        }
        session.events().publish(SessionEvent::PlanComplete {
            plan_id: plan_id.to_string(),
            status,
        });
    }

    // ========================================================================
    // Best-effort persistence
    // ========================================================================

    async fn insert_record(
        &self,
        session: &Session,
        tool_name: &str,
        input: &serde_json::Value,
        tier: RiskTier,
        status: InvocationStatus,
    ) -> Option<String> {
        let record =
            ToolInvocationRecord::new(session.id(), tool_name, input.clone(), tier, status);
        match self.store.insert_invocation(&record).await {
            Ok(()) => Some(record.id),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to persist invocation record");
                None
            }
        }
    }

    async fn update_record(&self, id: &str, update: InvocationUpdate) {
        if let Err(e) = self.store.update_invocation(id, update).await {
            tracing::warn!(invocation_id = %id, error = %e, "Failed to update invocation record");
        }
    }

    async fn record_audit(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.record(entry).await {
            tracing::warn!(error = %e, "Failed to write audit record");
        }
    }
}

fn ticket(
    tool_name: &str,
    input: &serde_json::Value,
    risk_tier: RiskTier,
    invocation_id: Option<String>,
    approved: bool,
    plan_step: Option<usize>,
) -> ToolTicket {
    ToolTicket {
        tool_name: tool_name.to_string(),
        input: input.clone(),
        risk_tier,
        invocation_id,
        approved,
        plan_step,
    }
}

/// Reason to deny, or `None` to continue; checker failures deny
fn denial_reason(check: &str, decision: Result<PolicyDecision>) -> Option<String> {
    match decision {
        Ok(PolicyDecision::Allow) => None,
        Ok(PolicyDecision::Deny(reason)) => Some(reason),
        Err(e) => {
            tracing::warn!(error = %e, "{} failed", check);
            Some(format!("{} failed: {}", check, e))
        }
    }
}

fn untracked_tool_use_id() -> String {
    format!("untracked-{}", uuid::Uuid::new_v4())
}

fn screenshot_of(output: &serde_json::Value) -> Option<&str> {
    output
        .get("imageBase64")
        .or_else(|| output.get("screenshot"))
        .and_then(|v| v.as_str())
}

/// [`ToolHooks`] bound to one session
pub struct SessionToolGate {
    session: Arc<Session>,
    guardrail: Arc<Guardrail>,
}

impl SessionToolGate {
    pub fn new(session: Arc<Session>, guardrail: Arc<Guardrail>) -> Self {
        Self { session, guardrail }
    }
}

#[async_trait]
impl ToolHooks for SessionToolGate {
    async fn pre_tool_use(&self, tool_name: &str, input: &serde_json::Value) -> GateDecision {
        self.session.touch();
        self.guardrail
            .pre_tool_use(&self.session, tool_name, input)
            .await
    }

    async fn post_tool_use(&self, ticket: ToolTicket, output: ToolOutput) {
        self.session.touch();
        self.guardrail
            .post_tool_use(&self.session, ticket, output)
            .await
    }
}
