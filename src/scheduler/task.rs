//! Task records: the scheduler's unit of work.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status. Transitions are monotone (queued → running →
/// terminal) except for chat re-entry, which temporarily flips a
/// completed task back to running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dispatch priority. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    /// Sort key: lower ranks dispatch first.
    pub fn dispatch_rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-task budget overrides. Unset fields fall back to the scheduler
/// defaults.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_tool_calls: Option<u32>,
    pub max_steps: Option<u32>,
    pub idle_timeout_ms: Option<u64>,
}

impl ResourceLimits {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

/// Strictly non-decreasing usage counters, updated by the watchdog.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub tool_calls: u32,
    pub steps: u32,
    pub total_tokens: u64,
}

/// Options accepted by `TaskRunner::start`.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub priority: TaskPriority,
    pub limits: ResourceLimits,
    /// Knowledge-pack names. Opaque to the scheduler; carried so retry
    /// and redo reproduce the original agent setup.
    pub skills: Vec<String>,
}

/// One background sub-task. Owned by the scheduler for the process
/// lifetime; records are never deleted, so the full history stays
/// observable.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    /// Names the sub-agent role (executor, reviewer, …). Opaque here.
    pub template_id: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub prompt: String,
    pub skills: Vec<String>,
    pub retry_count: u32,
    /// Feedback strings from every redo of this lineage, oldest first.
    pub redo_history: Vec<String>,
    pub limits: ResourceLimits,
    pub usage: ResourceUsage,
    /// Millisecond epoch timestamps.
    pub start_time: Option<i64>,
    pub last_activity_time: Option<i64>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub cancel_reason: Option<String>,
    pub sandbox_url: Option<String>,
    pub sandbox_alive: bool,
    pub agent_alive: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Task {
    pub fn new(
        template_id: impl Into<String>,
        prompt: impl Into<String>,
        description: impl Into<String>,
        opts: StartOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            template_id: template_id.into(),
            description: description.into(),
            status: TaskStatus::Queued,
            priority: opts.priority,
            prompt: prompt.into(),
            skills: opts.skills,
            retry_count: 0,
            redo_history: Vec::new(),
            limits: opts.limits,
            usage: ResourceUsage::default(),
            start_time: None,
            last_activity_time: None,
            result: None,
            error: None,
            cancel_reason: None,
            sandbox_url: None,
            sandbox_alive: false,
            agent_alive: false,
            created_at: chrono::Utc::now(),
        }
    }

    /// Wall-clock ms since the task left the queue; None while queued.
    pub fn elapsed_ms(&self) -> Option<i64> {
        self.start_time
            .map(|start| (chrono::Utc::now().timestamp_millis() - start).max(0))
    }

    /// Serializable view for the HTTP listing.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            template_id: self.template_id.clone(),
            description: self.description.clone(),
            status: self.status,
            priority: self.priority,
            retry_count: self.retry_count,
            redo_history: self.redo_history.clone(),
            limits: self.limits,
            usage: self.usage,
            start_time: self.start_time,
            last_activity_time: self.last_activity_time,
            elapsed_ms: self.elapsed_ms(),
            result: self.result.clone(),
            error: self.error.clone(),
            cancel_reason: self.cancel_reason.clone(),
            sandbox_url: self.sandbox_url.clone(),
            sandbox_alive: self.sandbox_alive,
            agent_alive: self.agent_alive,
        }
    }
}

/// Wire form of a task record. Carries the untruncated result: clients
/// that saw a truncated injection message fetch the full text here.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub template_id: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub retry_count: u32,
    pub redo_history: Vec<String>,
    pub limits: ResourceLimits,
    pub usage: ResourceUsage,
    pub start_time: Option<i64>,
    pub last_activity_time: Option<i64>,
    pub elapsed_ms: Option<i64>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub cancel_reason: Option<String>,
    pub sandbox_url: Option<String>,
    pub sandbox_alive: bool,
    pub agent_alive: bool,
}
