//! Scripted test doubles for the agent and sandbox contracts.
//!
//! `StubAgent` plays back a queue of scripted turns and lets tests emit
//! monitor events by hand, which is enough to drive the runner through
//! every lifecycle path without a real LLM runtime behind it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore, mpsc, oneshot};

use crate::agent::{
    Agent, AgentFactory, Completion, EventStream, MonitorEvent, PermissionReply,
    PermissionResponder, StreamEvent, ToolCallInfo,
};
use crate::error::{AgentError, SandboxError};
use crate::sandbox::{Sandbox, SandboxFactory, SandboxKind};

/// One scripted `complete` outcome.
#[derive(Debug, Clone)]
pub enum StubTurn {
    /// Finish normally with this text.
    Ok(String),
    /// Pause immediately (as after an interrupt).
    Paused,
    /// Fail with this error message.
    Error(String),
    /// Block until `interrupt` is called, then pause. Emits nothing, so
    /// it is also how tests starve the idle watchdog.
    HangUntilInterrupt,
    /// Block until the test calls `release`, then finish with this text.
    /// Lets tests hold a task in running while others queue behind it.
    OkWhenReleased(String),
}

/// Scripted agent. `complete` pops turns front-to-back; an empty script
/// finishes with a default text so tests never hang by accident.
pub struct StubAgent {
    script: Mutex<VecDeque<StubTurn>>,
    stream_script: Mutex<VecDeque<Vec<StreamEvent>>>,
    /// Every input `complete` has been called with, in order.
    inputs: Mutex<Vec<String>>,
    /// Every input `chat_stream` has been called with, in order.
    stream_inputs: Mutex<Vec<String>>,
    monitors: Mutex<Vec<mpsc::UnboundedSender<MonitorEvent>>>,
    interrupt_flag: AtomicBool,
    interrupt_signal: Notify,
    interrupts: AtomicUsize,
    releases: Semaphore,
}

impl StubAgent {
    pub fn new(script: impl IntoIterator<Item = StubTurn>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            stream_script: Mutex::new(VecDeque::new()),
            inputs: Mutex::new(Vec::new()),
            stream_inputs: Mutex::new(Vec::new()),
            monitors: Mutex::new(Vec::new()),
            interrupt_flag: AtomicBool::new(false),
            interrupt_signal: Notify::new(),
            interrupts: AtomicUsize::new(0),
            releases: Semaphore::new(0),
        })
    }

    /// Agent that completes once with `text`.
    pub fn completing(text: &str) -> Arc<Self> {
        Self::new([StubTurn::Ok(text.to_string())])
    }

    /// Queue more turns after construction.
    pub fn push_turn(&self, turn: StubTurn) {
        self.script.lock().expect("script poisoned").push_back(turn);
    }

    /// Queue a scripted `chat_stream` response.
    pub fn push_stream(&self, events: Vec<StreamEvent>) {
        self.stream_script
            .lock()
            .expect("stream script poisoned")
            .push_back(events);
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().expect("inputs poisoned").clone()
    }

    pub fn stream_inputs(&self) -> Vec<String> {
        self.stream_inputs.lock().expect("inputs poisoned").clone()
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    /// Unblock one pending (or future) `OkWhenReleased` turn.
    pub fn release(&self) {
        self.releases.add_permits(1);
    }

    /// Send a monitor event to the most recent subscriber.
    pub fn emit(&self, event: MonitorEvent) {
        let monitors = self.monitors.lock().expect("monitors poisoned");
        if let Some(tx) = monitors.last() {
            let _ = tx.send(event);
        }
    }

    pub fn emit_tool_executed(&self, name: &str) {
        self.emit(MonitorEvent::ToolExecuted {
            call: ToolCallInfo {
                name: name.to_string(),
                input: serde_json::Value::Null,
            },
        });
    }

    pub fn emit_step_complete(&self) {
        self.emit(MonitorEvent::StepComplete);
    }

    pub fn emit_token_usage(&self, tokens: u64) {
        self.emit(MonitorEvent::TokenUsage { tokens });
    }

    /// Raise a permission request; returns the receiver the runtime
    /// would block the tool on.
    pub fn emit_permission(
        &self,
        call: ToolCallInfo,
    ) -> oneshot::Receiver<PermissionReply> {
        let (responder, rx) = PermissionResponder::channel();
        self.emit(MonitorEvent::PermissionRequired { call, responder });
        rx
    }
}

#[async_trait]
impl Agent for StubAgent {
    async fn complete(&self, input: &str) -> Result<Completion, AgentError> {
        self.inputs
            .lock()
            .expect("inputs poisoned")
            .push(input.to_string());

        let turn = self
            .script
            .lock()
            .expect("script poisoned")
            .pop_front()
            .unwrap_or_else(|| StubTurn::Ok("stub: script exhausted".to_string()));

        match turn {
            StubTurn::Ok(text) => Ok(Completion::ok(text)),
            StubTurn::Paused => Ok(Completion::paused()),
            StubTurn::Error(reason) => Err(AgentError::CompletionFailed { reason }),
            StubTurn::HangUntilInterrupt => {
                loop {
                    // Register before checking the flag so an interrupt
                    // landing in between cannot be missed. The flag is
                    // sticky until a hang consumes it, covering
                    // interrupts that arrive before `complete` does.
                    let notified = self.interrupt_signal.notified();
                    if self.interrupt_flag.swap(false, Ordering::SeqCst) {
                        break;
                    }
                    notified.await;
                }
                Ok(Completion::paused())
            }
            StubTurn::OkWhenReleased(text) => {
                let permit = self
                    .releases
                    .acquire()
                    .await
                    .expect("release semaphore closed");
                permit.forget();
                Ok(Completion::ok(text))
            }
        }
    }

    async fn chat_stream(&self, input: &str) -> Result<EventStream, AgentError> {
        self.stream_inputs
            .lock()
            .expect("inputs poisoned")
            .push(input.to_string());

        let events = self
            .stream_script
            .lock()
            .expect("stream script poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                vec![
                    StreamEvent::TextChunkStart,
                    StreamEvent::TextChunk {
                        delta: "ack".to_string(),
                    },
                    StreamEvent::Done { reason: None },
                ]
            });
        Ok(Box::pin(futures::stream::iter(events)))
    }

    async fn interrupt(&self, _note: Option<&str>) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        self.interrupt_flag.store(true, Ordering::SeqCst);
        self.interrupt_signal.notify_waiters();
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<MonitorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.monitors.lock().expect("monitors poisoned").push(tx);
        rx
    }
}

/// Factory that hands out pre-built stub agents in dispatch order, then
/// default agents once the queue is empty.
#[derive(Default)]
pub struct StubAgentFactory {
    queue: Mutex<VecDeque<Arc<StubAgent>>>,
    created: Mutex<Vec<(String, Arc<StubAgent>)>>,
}

impl StubAgentFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, agent: Arc<StubAgent>) {
        self.queue.lock().expect("factory poisoned").push_back(agent);
    }

    /// (template_id, agent) pairs in creation order.
    pub fn created(&self) -> Vec<(String, Arc<StubAgent>)> {
        self.created.lock().expect("factory poisoned").clone()
    }
}

#[async_trait]
impl AgentFactory for StubAgentFactory {
    async fn create(
        &self,
        template_id: &str,
        _skills: &[String],
    ) -> Result<Arc<dyn Agent>, AgentError> {
        let agent = self
            .queue
            .lock()
            .expect("factory poisoned")
            .pop_front()
            .unwrap_or_else(|| StubAgent::completing("stub: default result"));
        self.created
            .lock()
            .expect("factory poisoned")
            .push((template_id.to_string(), Arc::clone(&agent)));
        Ok(agent)
    }
}

/// Sandbox that counts disposals so idempotency is assertable.
pub struct StubSandbox {
    kind: SandboxKind,
    disposals: AtomicUsize,
}

impl StubSandbox {
    pub fn new(kind: SandboxKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            disposals: AtomicUsize::new(0),
        })
    }

    pub fn disposal_count(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for StubSandbox {
    fn kind(&self) -> SandboxKind {
        self.kind
    }

    async fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory that records every sandbox it creates.
pub struct StubSandboxFactory {
    created: Mutex<Vec<Arc<StubSandbox>>>,
}

impl StubSandboxFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> Vec<Arc<StubSandbox>> {
        self.created.lock().expect("factory poisoned").clone()
    }
}

#[async_trait]
impl SandboxFactory for StubSandboxFactory {
    async fn create(&self, kind: SandboxKind) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let sandbox = StubSandbox::new(kind);
        self.created
            .lock()
            .expect("factory poisoned")
            .push(Arc::clone(&sandbox));
        Ok(sandbox)
    }
}
