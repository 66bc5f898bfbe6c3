//! Result injection back into the parent conversation.
//!
//! Every terminal task transition (and every keep-alive chat re-entry)
//! produces one synthetic message describing the outcome. The queue feeds
//! those messages to the parent agent one at a time, holding the chat
//! lock across each streamed reaction so injections and user turns never
//! interleave. Injection failures are logged and never touch the
//! originating task's status.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::StreamExt;
use serde::Serialize;
use uuid::Uuid;

use crate::agent::{Agent, StreamEvent};
use crate::bus::{EventBus, SseEvent};
use crate::chat::ChatLock;
use crate::error::AgentError;
use crate::history::{HistoryStore, Role};
use crate::scheduler::task::Task;

/// Why a message is being injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionKind {
    TaskResult,
    TaskFailed,
    TaskCancelled,
    ChatResult,
    ChatFailed,
}

impl InjectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskResult => "task_result",
            Self::TaskFailed => "task_failed",
            Self::TaskCancelled => "task_cancelled",
            Self::ChatResult => "chat_result",
            Self::ChatFailed => "chat_failed",
        }
    }
}

/// One queued injection.
#[derive(Debug, Clone)]
pub struct InjectionItem {
    pub message: String,
    pub task_id: Uuid,
    pub kind: InjectionKind,
}

/// Serialized FIFO injector. Shared via `Arc`; `enqueue` kicks a single
/// background processor that drains the queue under the chat lock.
pub struct InjectionQueue {
    parent: Arc<dyn Agent>,
    bus: EventBus,
    lock: Arc<ChatLock>,
    history: Arc<HistoryStore>,
    queue: std::sync::Mutex<VecDeque<InjectionItem>>,
    processing: AtomicBool,
    weak_self: Weak<InjectionQueue>,
}

impl InjectionQueue {
    pub fn new(
        parent: Arc<dyn Agent>,
        bus: EventBus,
        lock: Arc<ChatLock>,
        history: Arc<HistoryStore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            parent,
            bus,
            lock,
            history,
            queue: std::sync::Mutex::new(VecDeque::new()),
            processing: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    /// Append an item and make sure a processor is running.
    pub fn enqueue(&self, item: InjectionItem) {
        tracing::debug!(
            task_id = %item.task_id,
            kind = item.kind.as_str(),
            "Injection enqueued"
        );
        {
            let mut queue = self.queue.lock().expect("injection queue poisoned");
            queue.push_back(item);
        }
        self.kick();
    }

    pub fn depth(&self) -> usize {
        self.queue.lock().expect("injection queue poisoned").len()
    }

    fn kick(&self) {
        if !self.processing.swap(true, Ordering::AcqRel) {
            let this = self
                .weak_self
                .upgrade()
                .expect("injection queue outlived its own Arc");
            tokio::spawn(async move { this.process().await });
        }
    }

    async fn process(self: Arc<Self>) {
        loop {
            let item = {
                let mut queue = self.queue.lock().expect("injection queue poisoned");
                queue.pop_front()
            };

            let Some(item) = item else {
                self.processing.store(false, Ordering::Release);
                // An enqueue may have slipped in between the pop and the
                // flag clear; re-claim the flag and keep draining if so.
                let refill = !self.queue.lock().expect("injection queue poisoned").is_empty();
                if refill && !self.processing.swap(true, Ordering::AcqRel) {
                    continue;
                }
                return;
            };

            let _guard = self.lock.acquire().await;
            if let Err(e) = self.inject_and_stream(&item).await {
                tracing::error!(
                    task_id = %item.task_id,
                    kind = item.kind.as_str(),
                    "Injection failed: {}",
                    e
                );
            }
        }
    }

    /// Stream the parent's reaction to one injected message.
    async fn inject_and_stream(&self, item: &InjectionItem) -> Result<(), AgentError> {
        self.bus.send(&SseEvent::OrchestratorStart {
            task_id: item.task_id,
            reason: item.kind.as_str().to_string(),
        });

        let mut stream = self.parent.chat_stream(&item.message).await?;
        let mut reaction = String::new();
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::TextChunk { delta } => {
                    reaction.push_str(&delta);
                    self.bus.send(&SseEvent::OrchestratorText { delta });
                }
                StreamEvent::ThinkChunk { delta } => {
                    self.bus.send(&SseEvent::Thinking { delta });
                }
                StreamEvent::ToolStart { call } => {
                    self.bus.send(&SseEvent::ToolStart { call });
                }
                StreamEvent::ToolEnd { call } => {
                    self.bus.send(&SseEvent::ToolEnd { call });
                }
                StreamEvent::ToolError { call, error } => {
                    self.bus.send(&SseEvent::ToolError { call, error });
                }
                StreamEvent::TextChunkStart
                | StreamEvent::ThinkChunkStart
                | StreamEvent::Done { .. } => {}
            }
        }

        if !reaction.is_empty() {
            self.history.push(Role::Assistant, reaction);
        }
        self.bus.send(&SseEvent::OrchestratorDone {
            task_id: item.task_id,
        });
        Ok(())
    }
}

// -- Message composition --

/// Truncate to `limit` chars, appending a notice pointing at the task
/// listing where the full text remains available.
fn truncate_result(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{}\n……(结果已截断至{}字符, 完整内容见 bg_task_status)", cut, limit)
}

/// `task_result` message for a completed task.
pub fn compose_completed(task: &Task, limit: usize) -> String {
    let result = task.result.as_deref().unwrap_or("");
    format!(
        "[子任务完成] taskId={}, agent={}\n描述: {}\n交付物:\n{}",
        task.id,
        task.template_id,
        task.description,
        truncate_result(result, limit)
    )
}

/// `task_failed` message.
pub fn compose_failed(task: &Task) -> String {
    format!(
        "[子任务失败] taskId={}, agent={}\n描述: {}\n错误: {}",
        task.id,
        task.template_id,
        task.description,
        task.error.as_deref().unwrap_or("unknown error")
    )
}

/// `task_cancelled` message.
pub fn compose_cancelled(task: &Task) -> String {
    format!(
        "[子任务取消] taskId={}, agent={}\n描述: {}\n原因: {}",
        task.id,
        task.template_id,
        task.description,
        task.cancel_reason.as_deref().unwrap_or("cancelled by orchestrator")
    )
}

/// `chat_result` message for a keep-alive chat reply.
pub fn compose_chat_result(task: &Task, reply: &str, limit: usize) -> String {
    format!(
        "[子任务对话回复] taskId={}, agent={}\n描述: {}\n回复:\n{}",
        task.id,
        task.template_id,
        task.description,
        truncate_result(reply, limit)
    )
}

/// `chat_failed` message.
pub fn compose_chat_failed(task: &Task, error: &str) -> String {
    format!(
        "[子任务对话失败] taskId={}, agent={}\n描述: {}\n错误: {}",
        task.id, task.template_id, task.description, error
    )
}
