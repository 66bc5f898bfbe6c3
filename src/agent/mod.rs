//! Contract with the LLM agent runtime.
//!
//! The runtime itself (prompt assembly, model calls, tool execution) lives
//! outside this crate. The orchestrator consumes it through the [`Agent`]
//! trait: single-shot completions that may pause for interrupts, a
//! streaming chat variant used for the parent orchestrator, and a monitor
//! subscription carrying tool/step/token/permission events.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::AgentError;

/// Result of a single `complete` call.
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: CompletionStatus,
    /// Final text output. Present on `Ok`; may be absent on `Paused`.
    pub text: Option<String>,
}

impl Completion {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            status: CompletionStatus::Ok,
            text: Some(text.into()),
        }
    }

    pub fn paused() -> Self {
        Self {
            status: CompletionStatus::Paused,
            text: None,
        }
    }
}

/// Whether a completion ran to its natural end or paused at a safe point
/// (after an interrupt, or for any runtime-internal reason).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Ok,
    Paused,
}

/// A tool invocation as reported by the agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallInfo {
    pub name: String,
    /// Tool input preview. Opaque to the scheduler; the safety policy
    /// extracts command strings from it.
    pub input: serde_json::Value,
}

/// Events emitted on the streaming chat path (`chat_stream`).
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextChunkStart,
    TextChunk { delta: String },
    ThinkChunkStart,
    ThinkChunk { delta: String },
    ToolStart { call: ToolCallInfo },
    ToolEnd { call: ToolCallInfo },
    ToolError { call: ToolCallInfo, error: String },
    Done { reason: Option<String> },
}

/// Events delivered on a monitor subscription.
#[derive(Debug)]
pub enum MonitorEvent {
    /// A tool needs a permission decision before it can run. The runtime
    /// blocks that tool (not the monitor stream) until `responder` fires.
    PermissionRequired {
        call: ToolCallInfo,
        responder: PermissionResponder,
    },
    /// A tool finished executing.
    ToolExecuted { call: ToolCallInfo },
    /// One agentic step (LLM round-trip) completed.
    StepComplete,
    /// Tokens consumed since the previous report.
    TokenUsage { tokens: u64 },
    /// The runtime compressed its context window.
    ContextCompression {
        phase: String,
        summary: Option<String>,
    },
}

/// Permission decision for a pending tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny,
}

/// Reply delivered back to the runtime for a `PermissionRequired` event.
#[derive(Debug, Clone)]
pub struct PermissionReply {
    pub decision: PermissionDecision,
    pub note: Option<String>,
}

/// One-shot responder handed out with each `PermissionRequired` event.
///
/// The first `respond` wins; later calls are no-ops returning false.
#[derive(Debug)]
pub struct PermissionResponder {
    tx: std::sync::Mutex<Option<oneshot::Sender<PermissionReply>>>,
}

impl PermissionResponder {
    /// Create a responder and the receiving half the runtime waits on.
    pub fn channel() -> (Self, oneshot::Receiver<PermissionReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: std::sync::Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Deliver the decision. Returns false if already responded or the
    /// runtime stopped waiting.
    pub fn respond(&self, decision: PermissionDecision, note: Option<String>) -> bool {
        let Some(tx) = self.tx.lock().expect("responder lock poisoned").take() else {
            return false;
        };
        tx.send(PermissionReply { decision, note }).is_ok()
    }
}

/// Stream type returned by `chat_stream`.
pub type EventStream = BoxStream<'static, StreamEvent>;

/// The agent runtime as seen by the orchestrator.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run a completion to its end or to the next safe pause point.
    async fn complete(&self, input: &str) -> Result<Completion, AgentError>;

    /// Streaming variant used for the parent orchestrator conversation.
    async fn chat_stream(&self, input: &str) -> Result<EventStream, AgentError>;

    /// Request a pause at the next safe point. Best-effort; the in-flight
    /// `complete` resolves with `Paused`.
    async fn interrupt(&self, note: Option<&str>);

    /// Open a monitor subscription. Each call returns an independent
    /// receiver; events are delivered in emission order.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<MonitorEvent>;
}

/// Constructs sub-agents from a template id and skill list.
///
/// Templates (prompt text, tool allowlist) are opaque to the scheduler.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(
        &self,
        template_id: &str,
        skills: &[String],
    ) -> Result<Arc<dyn Agent>, AgentError>;
}
