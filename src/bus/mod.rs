//! Typed SSE event bus.
//!
//! A broadcast channel fanning orchestrator events out to every connected
//! client. Events are serialized once at `send` and shared by reference;
//! delivery is best-effort with no per-connection buffering — a slow
//! consumer may lag and miss events, and reconciles through the snapshot
//! endpoints (`/api/status`, `/api/bg-tasks`).

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::agent::ToolCallInfo;

/// Wire envelope: serialized as `{"type": ..., "data": ...}` and written
/// to clients as `data: <JSON>\n\n`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SseEvent {
    /// Assistant text delta from a streaming turn.
    Text { delta: String },
    /// Reasoning text delta.
    Thinking { delta: String },
    ToolStart { call: ToolCallInfo },
    ToolEnd { call: ToolCallInfo },
    ToolError { call: ToolCallInfo, error: String },
    /// A tool call is parked waiting for a human decision.
    ApprovalNeeded {
        permission_id: String,
        task_id: Option<Uuid>,
        tool_name: String,
        input: serde_json::Value,
    },
    /// Heartbeat / progress record for an active task.
    Progress {
        task_id: Uuid,
        percent: u8,
        stage: String,
        message: Option<String>,
    },
    /// Coarse phase announcements (task transitions, context compression).
    Phase {
        name: String,
        task_id: Option<Uuid>,
        detail: Option<String>,
    },
    /// A streaming turn finished.
    Done { reason: Option<String> },
    Error { message: String },
    /// An injection began streaming the parent's reaction.
    OrchestratorStart { task_id: Uuid, reason: String },
    /// Parent-agent text produced while reacting to an injection.
    OrchestratorText { delta: String },
    OrchestratorDone { task_id: Uuid },
}

/// Broadcast bus. Cheap to clone; all clones share the channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Arc<String>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Serialize once and fan out. Send errors just mean nobody is
    /// listening right now.
    pub fn send(&self, event: &SseEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                let _ = self.tx.send(Arc::new(json));
            }
            Err(e) => {
                tracing::error!("Failed to serialize SSE event: {}", e);
            }
        }
    }

    /// Register a new consumer. Dropped receivers are pruned by the
    /// channel itself.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<String>> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn connections(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
