//! Shared fixtures for integration tests
//!
//! `ScriptedEngine` is an in-process engine: for every user message it asks a
//! script for a list of steps and plays them back through the same output
//! stream and tool hooks a real engine would use.

#![allow(dead_code)]

use a3s_session::{
    ActorContext, ContentBlock, CoreConfig, DefaultPolicy, EngineControl, EngineHandle,
    EngineMessage, EngineRequest, Fragment, GateDecision, Guardrail, InputFeed, MemoryAuditLog,
    MemorySessionStore, QueryEngineFactory, Result, SessionError, SessionEvent, SessionRegistry,
    Subscription, TokenUsage, ToolCatalog, ToolHooks, ToolOutput, TurnOutcome, TurnResult,
    UserMessage,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// One scripted engine action
#[derive(Debug, Clone)]
pub enum Step {
    /// Yield this item
    Emit(EngineMessage),
    /// Announce a tool call, then run it through the hooks
    Tool {
        id: String,
        name: String,
        input: serde_json::Value,
        output: ToolOutput,
    },
    /// Announce a tool call without running it
    Announce {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Run a tool call through the hooks without announcing it
    Run {
        name: String,
        input: serde_json::Value,
        output: ToolOutput,
    },
    /// Fail the output stream
    Fail(String),
    /// Block until interrupted (then report an interrupted result) or closed
    Hang,
}

pub type Script = Arc<dyn Fn(&str) -> Vec<Step> + Send + Sync>;

/// What the engine observed
#[derive(Default)]
pub struct EngineLog {
    pub started: Mutex<Vec<StartRecord>>,
    pub messages: Mutex<Vec<UserMessage>>,
    pub decisions: Mutex<Vec<(String, GateDecision)>>,
    pub interrupts: AtomicUsize,
    pub closes: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct StartRecord {
    pub session_id: String,
    pub resume_conversation_id: Option<String>,
    pub allowed_tools: Vec<String>,
    pub max_budget_usd: Option<f64>,
}

impl EngineLog {
    pub fn decisions(&self) -> Vec<(String, GateDecision)> {
        self.decisions.lock().unwrap().clone()
    }
}

pub struct ScriptedEngine {
    script: Script,
    pub log: Arc<EngineLog>,
}

impl ScriptedEngine {
    pub fn new(script: impl Fn(&str) -> Vec<Step> + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            log: Arc::new(EngineLog::default()),
        }
    }
}

struct ScriptedControl {
    closed: CancellationToken,
    interrupt: Notify,
    log: Arc<EngineLog>,
}

#[async_trait]
impl EngineControl for ScriptedControl {
    async fn interrupt(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(SessionError::Engine("engine closed".to_string()));
        }
        self.log.interrupts.fetch_add(1, Ordering::SeqCst);
        self.interrupt.notify_one();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }
}

struct Playback {
    input: InputFeed,
    hooks: Arc<dyn ToolHooks>,
    script: Script,
    queue: VecDeque<Step>,
    pending: Option<(String, serde_json::Value, ToolOutput)>,
    control: Arc<ScriptedControl>,
}

impl Playback {
    async fn run_tool(&mut self, name: String, input: serde_json::Value, output: ToolOutput) {
        let decision = self.hooks.pre_tool_use(&name, &input).await;
        self.control
            .log
            .decisions
            .lock()
            .unwrap()
            .push((name, decision.clone()));
        if let GateDecision::Allow(ticket) = decision {
            self.hooks.post_tool_use(ticket, output).await;
        }
    }
}

async fn next_item(mut p: Playback) -> Option<(Result<EngineMessage>, Playback)> {
    loop {
        if let Some((name, input, output)) = p.pending.take() {
            p.run_tool(name, input, output).await;
            continue;
        }

        match p.queue.pop_front() {
            Some(Step::Emit(message)) => return Some((Ok(message), p)),
            Some(Step::Tool {
                id,
                name,
                input,
                output,
            }) => {
                p.pending = Some((name.clone(), input.clone(), output));
                return Some((Ok(EngineMessage::ToolUse { id, name, input }), p));
            }
            Some(Step::Announce { id, name, input }) => {
                return Some((Ok(EngineMessage::ToolUse { id, name, input }), p))
            }
            Some(Step::Run {
                name,
                input,
                output,
            }) => p.run_tool(name, input, output).await,
            Some(Step::Fail(message)) => return Some((Err(SessionError::Engine(message)), p)),
            Some(Step::Hang) => {
                let control = p.control.clone();
                tokio::select! {
                    _ = control.closed.cancelled() => return None,
                    _ = control.interrupt.notified() => {
                        let result = TurnResult::failed(TurnOutcome::Error("interrupted".to_string()));
                        return Some((Ok(EngineMessage::Result(result)), p));
                    }
                }
            }
            None => {
                let control = p.control.clone();
                let message = tokio::select! {
                    _ = control.closed.cancelled() => return None,
                    message = p.input.next() => message?,
                };
                control.log.messages.lock().unwrap().push(message.clone());
                let steps = (p.script)(&message.text);
                p.queue.extend(steps);
            }
        }
    }
}

impl QueryEngineFactory for ScriptedEngine {
    fn start(&self, request: EngineRequest) -> Result<EngineHandle> {
        self.log.started.lock().unwrap().push(StartRecord {
            session_id: request.session_id.clone(),
            resume_conversation_id: request.resume_conversation_id.clone(),
            allowed_tools: request.allowed_tools.clone(),
            max_budget_usd: request.max_budget_usd,
        });

        let conversation_id = request
            .resume_conversation_id
            .clone()
            .unwrap_or_else(|| format!("conv-{}", request.session_id));
        let control = Arc::new(ScriptedControl {
            closed: CancellationToken::new(),
            interrupt: Notify::new(),
            log: self.log.clone(),
        });
        let playback = Playback {
            input: request.input,
            hooks: request.hooks,
            script: self.script.clone(),
            queue: VecDeque::from([Step::Emit(EngineMessage::Ready { conversation_id })]),
            pending: None,
            control: control.clone(),
        };

        Ok(EngineHandle {
            control,
            output: futures::stream::unfold(playback, next_item).boxed(),
        })
    }
}

/// Engine factory that always fails
pub struct BrokenEngine;

impl QueryEngineFactory for BrokenEngine {
    fn start(&self, _request: EngineRequest) -> Result<EngineHandle> {
        Err(SessionError::Engine("model endpoint unreachable".to_string()))
    }
}

// ─── Script helpers ──────────────────────────────────────────────

pub fn usage(input_tokens: u64, output_tokens: u64) -> TokenUsage {
    TokenUsage {
        input_tokens,
        output_tokens,
        ..Default::default()
    }
}

/// A streamed assistant reply followed by a successful result
pub fn text_turn(reply: &str) -> Vec<Step> {
    let message_id = format!("msg-{}", uuid::Uuid::new_v4());
    vec![
        Step::Emit(EngineMessage::Fragment(Fragment::MessageStart {
            message_id: message_id.clone(),
        })),
        Step::Emit(EngineMessage::Fragment(Fragment::TextDelta {
            text: reply.to_string(),
        })),
        Step::Emit(EngineMessage::Fragment(Fragment::MessageDelta {
            usage: usage(12, 7),
        })),
        Step::Emit(EngineMessage::Fragment(Fragment::MessageStop)),
        Step::Emit(EngineMessage::Assistant {
            message_id,
            content: vec![ContentBlock::Text {
                text: reply.to_string(),
            }],
        }),
        success(),
    ]
}

pub fn success() -> Step {
    Step::Emit(EngineMessage::Result(TurnResult::success(usage(12, 7), 0.0025)))
}

pub fn tool(id: &str, name: &str, input: serde_json::Value) -> Step {
    Step::Tool {
        id: id.to_string(),
        name: name.to_string(),
        input,
        output: ToolOutput::ok(serde_json::json!({"ok": true})),
    }
}

// ─── Harness ─────────────────────────────────────────────────────

pub struct Harness {
    pub registry: SessionRegistry,
    pub store: Arc<MemorySessionStore>,
    pub audit: Arc<MemoryAuditLog>,
    pub log: Arc<EngineLog>,
}

pub fn harness(
    config: CoreConfig,
    catalog: ToolCatalog,
    script: impl Fn(&str) -> Vec<Step> + Send + Sync + 'static,
) -> Harness {
    let engine = ScriptedEngine::new(script);
    let log = engine.log.clone();
    harness_with_engine(config, catalog, Arc::new(engine), log)
}

pub fn harness_with_engine(
    config: CoreConfig,
    catalog: ToolCatalog,
    engine: Arc<dyn QueryEngineFactory>,
    log: Arc<EngineLog>,
) -> Harness {
    init_tracing();
    let store = Arc::new(MemorySessionStore::new());
    let audit = Arc::new(MemoryAuditLog::default());
    let guardrail = Arc::new(Guardrail::new(
        Arc::new(catalog),
        Arc::new(DefaultPolicy::new()),
        store.clone(),
        audit.clone(),
        &config.guardrail,
    ));
    let registry = SessionRegistry::new(config.registry, engine, guardrail, store.clone());
    Harness {
        registry,
        store,
        audit,
        log,
    }
}

/// Route logs to the test writer; `RUST_LOG=a3s_session=debug` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn actor() -> ActorContext {
    ActorContext::new("operator-1", "org-acme")
}

/// Next event, failing the test if none arrives in time
pub async fn next_event(sub: &mut Subscription) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("subscription ended")
        .event
}

/// Collect events up to and including the next `done`
pub async fn until_done(sub: &mut Subscription) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(sub).await;
        let done = matches!(event, SessionEvent::Done { .. });
        events.push(event);
        if done {
            return events;
        }
    }
}

pub fn kinds(events: &[SessionEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind()).collect()
}

/// Poll `condition` until it holds or five seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Wait for the engine's ready handshake
pub async fn wait_ready(session: &a3s_session::Session) {
    let ready = eventually(|| session.state() == a3s_session::SessionState::Ready).await;
    assert!(ready, "session {} never became ready", session.id());
}
