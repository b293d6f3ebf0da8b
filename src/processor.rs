//! Background processor
//!
//! One task per session drains the engine's output stream, turns each item
//! into bus events and transcript rows, and closes turns. When the stream
//! ends, fails, or the session is cancelled, the session is removed from the
//! registry.

use crate::engine::{ContentBlock, EngineMessage, EngineOutput, Fragment, TurnOutcome, TurnResult};
use crate::event::{ErrorKind, SessionEvent};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionState};
use crate::store::{SessionRecord, SessionStore};
use crate::types::{TokenUsage, TranscriptEntry, TranscriptRole};
use futures::StreamExt;
use std::sync::Arc;
use tracing::Instrument;

/// Tracks the assistant message currently streaming
#[derive(Debug, Default)]
struct MessageTracker {
    current: Option<String>,
    usage: TokenUsage,
}

pub(crate) struct BackgroundProcessor {
    session: Arc<Session>,
    registry: SessionRegistry,
    store: Arc<dyn SessionStore>,
    output: EngineOutput,
    message: MessageTracker,
}

impl BackgroundProcessor {
    pub(crate) fn new(
        session: Arc<Session>,
        registry: SessionRegistry,
        store: Arc<dyn SessionStore>,
        output: EngineOutput,
    ) -> Self {
        Self {
            session,
            registry,
            store,
            output,
            message: MessageTracker::default(),
        }
    }

    pub(crate) fn spawn(self) -> tokio::task::JoinHandle<()> {
        let span = tracing::info_span!(
            "a3s.session.processor",
            a3s.session.id = %self.session.id(),
        );
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(mut self) {
        let cancel = self.session.cancellation_token();
        tracing::debug!("Background processor started");

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("Session cancelled, stopping processor");
                    break;
                }
                item = self.output.next() => item,
            };

            match item {
                Some(Ok(message)) => self.handle(message).await,
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Engine output failed");
                    self.session
                        .events()
                        .publish(SessionEvent::error(ErrorKind::Engine, e.to_string()));
                    self.session.events().publish(SessionEvent::done());
                    break;
                }
                None => {
                    if self.session.state() == SessionState::Processing {
                        tracing::warn!("Engine output ended mid-turn");
                        self.session.events().publish(SessionEvent::error(
                            ErrorKind::Engine,
                            "The assistant stopped responding before the turn finished",
                        ));
                        self.session.events().publish(SessionEvent::done());
                    } else {
                        tracing::debug!("Engine output ended");
                    }
                    break;
                }
            }
        }

        // Always release the session, whichever way the loop ended.
        self.registry.release(&self.session).await;
    }

    async fn handle(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::Ready { conversation_id } => self.on_ready(conversation_id).await,
            EngineMessage::Fragment(fragment) => self.on_fragment(fragment),
            EngineMessage::ToolUse { id, name, input } => {
                if let Some(evicted) = self.session.push_tool_use(id.clone(), name.clone()) {
                    tracing::warn!(
                        tool_use_id = %evicted.tool_use_id,
                        "Tool correlation queue full, closing oldest entry"
                    );
                    self.session.events().publish(SessionEvent::ToolResult {
                        tool_use_id: evicted.tool_use_id,
                        tool_name: evicted.tool_name,
                        output: serde_json::Value::String(
                            "Tool result was not observed before the correlation queue overflowed"
                                .to_string(),
                        ),
                        is_error: true,
                    });
                }
                self.session.events().publish(SessionEvent::ToolUseStart {
                    tool_use_id: id,
                    tool_name: name,
                    input,
                });
            }
            EngineMessage::Assistant {
                message_id,
                content,
            } => self.on_assistant(message_id, content).await,
            EngineMessage::Result(result) => self.on_result(result).await,
        }
        self.session.touch();
    }

    async fn on_ready(&mut self, conversation_id: String) {
        if self.session.input().set_conversation_id(conversation_id.clone()) {
            self.persist_session(|record| record.conversation_id = Some(conversation_id.clone()))
                .await;
        }
        if self.session.mark_ready() {
            tracing::info!(conversation_id = %conversation_id, "Engine ready");
        }
    }

    fn on_fragment(&mut self, fragment: Fragment) {
        let events = self.session.events();
        match fragment {
            Fragment::MessageStart { message_id } => {
                self.message.current = Some(message_id.clone());
                self.message.usage = TokenUsage::default();
                events.publish(SessionEvent::MessageStart { message_id });
            }
            Fragment::TextDelta { text } => {
                events.publish(SessionEvent::ContentDelta { text });
            }
            Fragment::MessageDelta { usage } => {
                self.message.usage = usage;
            }
            Fragment::MessageStop => {
                if let Some(message_id) = self.message.current.take() {
                    events.publish(SessionEvent::MessageEnd {
                        message_id,
                        usage: std::mem::take(&mut self.message.usage),
                    });
                }
            }
        }
    }

    async fn on_assistant(&mut self, message_id: String, content: Vec<ContentBlock>) {
        for block in content {
            let entry = match block {
                ContentBlock::Text { text } => TranscriptEntry::new(
                    self.session.id(),
                    TranscriptRole::Assistant,
                    serde_json::Value::String(text),
                ),
                ContentBlock::ToolUse { id, name, input } => {
                    TranscriptEntry::new(self.session.id(), TranscriptRole::ToolUse, input)
                        .with_tool(name, Some(id))
                }
            };
            if let Err(e) = self.store.append_transcript(&entry).await {
                tracing::warn!(message_id = %message_id, error = %e, "Failed to persist assistant transcript");
            }
        }
    }

    async fn on_result(&mut self, result: TurnResult) {
        if self.session.discard_stale_result() {
            tracing::debug!("Discarding result of a timed-out turn");
            return;
        }
        self.session.disarm_turn_timer();

        let orphaned = self
            .session
            .drain_tool_queue("Turn ended before the tool result was observed");
        if orphaned > 0 {
            tracing::warn!(orphaned = orphaned, "Closed tool calls left open at turn end");
        }

        let totals = self.session.record_usage(&result.usage, result.total_cost_usd);
        self.persist_session(|record| {
            record.total_usage = totals.usage.clone();
            record.total_cost_usd = totals.cost_usd;
            record.turn_count = totals.turns;
        })
        .await;

        let failure = match &result.outcome {
            TurnOutcome::Success => None,
            TurnOutcome::ErrorMaxBudget => Some((
                ErrorKind::BudgetExceeded,
                "The session budget has been used up".to_string(),
            )),
            TurnOutcome::ErrorMaxTurns => Some((
                ErrorKind::TurnLimitExceeded,
                "The assistant reached its turn limit".to_string(),
            )),
            TurnOutcome::Error(message) => Some((ErrorKind::Generic, message.clone())),
        };

        // Idle before `done` so a viewer reacting to it can start the next turn.
        self.session.finish_turn();

        let events = self.session.events();
        if let Some((kind, message)) = failure {
            tracing::warn!(kind = ?kind, message = %message, "Turn ended with error");
            events.publish(SessionEvent::error(kind, message));
        } else {
            tracing::info!(
                cost_usd = result.total_cost_usd,
                total_tokens = result.usage.total(),
                "Turn completed"
            );
        }
        events.publish(SessionEvent::Done {
            usage: Some(result.usage),
            total_cost_usd: Some(result.total_cost_usd),
        });
    }

    async fn persist_session(&mut self, update: impl FnOnce(&mut SessionRecord)) {
        let existing = match self.store.load_session(self.session.id()).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load session record");
                None
            }
        };
        let mut record = existing
            .unwrap_or_else(|| SessionRecord::new(self.session.id(), self.session.actor()));
        record.actor = self.session.actor();
        update(&mut record);
        if let Err(e) = self.store.save_session(&record).await {
            tracing::warn!(error = %e, "Failed to persist session record");
        }
    }
}
