//! The background task runner: priority dispatch, capacity limiting, and
//! per-task lifecycle management.
//!
//! ```text
//!        start()            capacity           complete() ok
//! queued ───────▶ pending ──────────▶ running ─────────────▶ completed
//!                    │cancel             │cancel                │ keep-alive, chat_async()
//!                    ▼                   ▼                      ▼
//!                cancelled           cancelled              running (chat) ─▶ completed
//!                                        │watchdog/error
//!                                        ▼
//!                                      failed
//! ```
//!
//! Each terminal transition updates the task record first, then enqueues
//! exactly one injection. Queued cancellations inject from `cancel`
//! itself; running tasks always inject from the teardown path, which is
//! the only place that observes their final state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agent::{Agent, AgentFactory, Completion, CompletionStatus, MonitorEvent};
use crate::approval::PermissionBridge;
use crate::bus::{EventBus, SseEvent};
use crate::config::{InjectionConfig, KeepAliveConfig, SchedulerConfig};
use crate::error::{AgentError, Error, NotFoundError, StateError};
use crate::injection::{self, InjectionItem, InjectionKind, InjectionQueue};
use crate::progress::ProgressTracker;
use crate::sandbox::{SandboxFactory, SandboxKind, SandboxRegistry};
use crate::scheduler::task::{
    ResourceLimits, StartOptions, Task, TaskPriority, TaskStatus,
};

/// Collaborators handed to the runner at construction. The injection
/// queue arrives later via `set_injector` because it needs the parent
/// agent, which in turn is wired after the runner exists.
pub struct RunnerDeps {
    pub agent_factory: Arc<dyn AgentFactory>,
    pub sandbox_factory: Arc<dyn SandboxFactory>,
    /// Sandbox kind created for every task. Drives the permission
    /// bridge's isolation shortcut.
    pub sandbox_kind: SandboxKind,
    pub registry: Arc<SandboxRegistry>,
    pub bridge: Arc<PermissionBridge>,
    pub bus: EventBus,
    pub progress: Arc<ProgressTracker>,
}

/// Budgets with scheduler defaults applied.
#[derive(Debug, Clone, Copy)]
struct EffectiveLimits {
    max_tool_calls: u32,
    max_steps: u32,
    idle_timeout: Duration,
}

pub struct TaskRunner {
    config: SchedulerConfig,
    keep_alive: KeepAliveConfig,
    injection_cfg: InjectionConfig,
    deps: RunnerDeps,
    injector: OnceLock<Arc<InjectionQueue>>,
    /// Handle back to our own `Arc`, for the tasks and timers we spawn.
    weak_self: Weak<TaskRunner>,

    /// All task records, forever. Lock order when several are needed:
    /// tasks → pending → agents → pending_messages → timers.
    tasks: Mutex<HashMap<Uuid, Task>>,
    /// Queued task ids, stable-sorted by priority rank on every enqueue.
    pending: Mutex<Vec<Uuid>>,
    /// Live sub-agents: running tasks plus keep-alive survivors.
    agents: Mutex<HashMap<Uuid, Arc<dyn Agent>>>,
    /// Next input stashed by `send_message`, consumed by the pause-loop.
    pending_messages: Mutex<HashMap<Uuid, String>>,
    agent_timers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    sandbox_timers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl TaskRunner {
    pub fn new(
        config: SchedulerConfig,
        keep_alive: KeepAliveConfig,
        injection_cfg: InjectionConfig,
        deps: RunnerDeps,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            keep_alive,
            injection_cfg,
            deps,
            injector: OnceLock::new(),
            weak_self: weak_self.clone(),
            tasks: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            agents: Mutex::new(HashMap::new()),
            pending_messages: Mutex::new(HashMap::new()),
            agent_timers: Mutex::new(HashMap::new()),
            sandbox_timers: Mutex::new(HashMap::new()),
        })
    }

    fn strong(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("runner outlived its own Arc")
    }

    /// Wire the injection queue. Called once during startup; breaks the
    /// runner ⇄ queue ⇄ parent-agent construction cycle.
    pub fn set_injector(&self, injector: Arc<InjectionQueue>) {
        if self.injector.set(injector).is_err() {
            tracing::warn!("Injection queue already wired; ignoring");
        }
    }

    // -- Public contract --

    /// Create a task and queue it. Never blocks on running capacity; the
    /// returned id is immediately observable through the accessors.
    pub fn start(
        &self,
        template_id: &str,
        prompt: &str,
        description: &str,
        opts: StartOptions,
    ) -> Uuid {
        let task = Task::new(template_id, prompt, description, opts);
        let id = task.id;
        let priority = task.priority;

        self.tasks
            .lock()
            .expect("task map poisoned")
            .insert(id, task);
        self.enqueue_pending(id);

        tracing::info!(
            task_id = %id,
            template = template_id,
            priority = %priority,
            "Task queued"
        );
        self.emit_status(id, TaskStatus::Queued);
        self.drain();
        id
    }

    /// Cancel a queued or running task. Queued tasks inject their
    /// cancellation here; running tasks are interrupted and inject from
    /// teardown.
    pub async fn cancel(&self, id: Uuid, reason: Option<String>) -> bool {
        enum Next {
            /// Was queued: the terminal transition happens right here,
            /// so this is also where its one injection comes from.
            InjectNow(Task),
            /// Was running: interrupt if the agent is already installed;
            /// either way the loop observes the cancelled record and its
            /// teardown performs the injection.
            Interrupt(Option<Arc<dyn Agent>>, Option<String>),
            Refused,
        }

        let next = {
            let mut tasks = self.tasks.lock().expect("task map poisoned");
            let Some(task) = tasks.get_mut(&id) else {
                return false;
            };
            match task.status {
                TaskStatus::Queued => {
                    task.status = TaskStatus::Cancelled;
                    task.cancel_reason = reason;
                    Next::InjectNow(task.clone())
                }
                TaskStatus::Running => {
                    task.status = TaskStatus::Cancelled;
                    task.cancel_reason = reason.clone();
                    let agent = self
                        .agents
                        .lock()
                        .expect("agent map poisoned")
                        .get(&id)
                        .cloned();
                    Next::Interrupt(agent, reason)
                }
                _ => Next::Refused,
            }
        };

        match next {
            Next::InjectNow(task) => {
                self.pending.lock().expect("pending poisoned").retain(|p| *p != id);
                tracing::info!(task_id = %id, "Queued task cancelled");
                self.emit_status(id, TaskStatus::Cancelled);
                self.inject(
                    id,
                    InjectionKind::TaskCancelled,
                    injection::compose_cancelled(&task),
                );
                true
            }
            Next::Interrupt(agent, reason) => {
                tracing::info!(task_id = %id, "Cancelling running task");
                self.emit_status(id, TaskStatus::Cancelled);
                if let Some(agent) = agent {
                    agent.interrupt(reason.as_deref()).await;
                }
                true
            }
            Next::Refused => false,
        }
    }

    /// Steer a running task: stash the next input and interrupt. The
    /// pause-loop picks the stash up and resumes with it.
    pub async fn send_message(&self, id: Uuid, instruction: String) -> bool {
        let agent = {
            let tasks = self.tasks.lock().expect("task map poisoned");
            match tasks.get(&id) {
                Some(task) if task.status == TaskStatus::Running => {}
                _ => return false,
            }
            self.agents
                .lock()
                .expect("agent map poisoned")
                .get(&id)
                .cloned()
        };
        let Some(agent) = agent else {
            return false;
        };

        self.pending_messages
            .lock()
            .expect("stash poisoned")
            .insert(id, instruction);
        agent.interrupt(Some("new instruction pending")).await;
        tracing::debug!(task_id = %id, "Steering message stashed");
        true
    }

    /// Re-enter a completed task's kept-alive sub-agent with a follow-up
    /// message. Runs in the background; the reply (or failure) arrives as
    /// a chat injection.
    pub fn chat_async(&self, id: Uuid, message: String) -> Result<(), Error> {
        let agent = {
            let mut tasks = self.tasks.lock().expect("task map poisoned");
            let task = tasks
                .get_mut(&id)
                .ok_or(NotFoundError::Task { id })?;
            // Running + agent_alive means a chat is already in flight;
            // there is never a concurrent chat against the same task.
            if !task.agent_alive || task.status == TaskStatus::Running {
                return Err(StateError {
                    status: task.status.to_string(),
                    operation: "与子代理对话".to_string(),
                }
                .into());
            }
            // Temporary flip back to running for the duration of the chat.
            task.status = TaskStatus::Running;
            self.agents
                .lock()
                .expect("agent map poisoned")
                .get(&id)
                .cloned()
        };
        let Some(agent) = agent else {
            // agent_alive without a live agent means a dispose raced us.
            let status = self.task(id).map(|t| t.status.to_string()).unwrap_or_default();
            return Err(StateError {
                status,
                operation: "与子代理对话".to_string(),
            }
            .into());
        };

        // The chat owns the keep-alive window now; re-armed when it ends.
        self.abort_timer(&self.agent_timers, id);
        self.emit_status(id, TaskStatus::Running);

        let this = self.strong();
        tokio::spawn(async move { this.run_chat(id, agent, message).await });
        Ok(())
    }

    /// Tear down a task's sandbox. Idempotent; false when already gone.
    pub async fn dispose_sandbox(&self, id: Uuid) -> bool {
        self.abort_timer(&self.sandbox_timers, id);
        let Some(sandbox) = self.deps.registry.remove(id).await else {
            return false;
        };
        sandbox.dispose().await;
        if let Some(task) = self.tasks.lock().expect("task map poisoned").get_mut(&id) {
            task.sandbox_alive = false;
        }
        tracing::debug!(task_id = %id, "Sandbox disposed");
        true
    }

    /// Tear down a task's kept-alive sub-agent. Idempotent.
    pub fn dispose_agent(&self, id: Uuid) {
        self.abort_timer(&self.agent_timers, id);
        let removed = self
            .agents
            .lock()
            .expect("agent map poisoned")
            .remove(&id)
            .is_some();
        if let Some(task) = self.tasks.lock().expect("task map poisoned").get_mut(&id) {
            task.agent_alive = false;
        }
        if removed {
            tracing::debug!(task_id = %id, "Sub-agent disposed");
        }
    }

    // -- Read accessors --

    pub fn task(&self, id: Uuid) -> Option<Task> {
        self.tasks.lock().expect("task map poisoned").get(&id).cloned()
    }

    /// Every task ever started, oldest first.
    pub fn all_tasks(&self) -> Vec<Task> {
        let tasks = self.tasks.lock().expect("task map poisoned");
        let mut list: Vec<Task> = tasks.values().cloned().collect();
        list.sort_by_key(|t| t.created_at);
        list
    }

    pub fn active_tasks(&self) -> Vec<Task> {
        self.all_tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Running)
            .collect()
    }

    pub fn queued_tasks(&self) -> Vec<Task> {
        let pending = self.pending.lock().expect("pending poisoned").clone();
        let tasks = self.tasks.lock().expect("task map poisoned");
        pending
            .iter()
            .filter_map(|id| tasks.get(id).cloned())
            .collect()
    }

    // -- Retry / redo --

    /// Re-dispatch a failed or cancelled task as a fresh one, preserving
    /// lineage. `modified_prompt` replaces the original when provided.
    pub fn retry(
        &self,
        id: Uuid,
        modified_prompt: Option<String>,
    ) -> Result<Uuid, Error> {
        let original = self.task(id).ok_or(NotFoundError::Task { id })?;
        if !matches!(original.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(StateError {
                status: original.status.to_string(),
                operation: "重试".to_string(),
            }
            .into());
        }

        let retry_count = original.retry_count + 1;
        let mut task = Task::new(
            &original.template_id,
            modified_prompt.unwrap_or_else(|| original.prompt.clone()),
            format!("{} (retry #{})", original.description, retry_count),
            StartOptions {
                priority: original.priority,
                limits: original.limits,
                skills: original.skills.clone(),
            },
        );
        task.retry_count = retry_count;
        task.redo_history = original.redo_history.clone();
        Ok(self.admit(task))
    }

    /// Re-run a completed task with feedback on why its result was
    /// rejected. The previous result rides along, truncated.
    pub fn redo(&self, id: Uuid, feedback: &str) -> Result<Uuid, Error> {
        let original = self.task(id).ok_or(NotFoundError::Task { id })?;
        if original.status != TaskStatus::Completed {
            return Err(StateError {
                status: original.status.to_string(),
                operation: "返工".to_string(),
            }
            .into());
        }

        let previous = original.result.as_deref().unwrap_or("");
        let truncated: String = previous
            .chars()
            .take(self.injection_cfg.redo_truncate_chars)
            .collect();
        let prompt = format!(
            "{}\n\n[previous result was rejected]\n{}\n\n[previous result]\n{}",
            original.prompt,
            feedback.trim(),
            truncated
        );

        let mut redo_history = original.redo_history.clone();
        redo_history.push(feedback.to_string());
        let redo_count = redo_history.len();

        let mut task = Task::new(
            &original.template_id,
            prompt,
            format!("{} (redo #{})", original.description, redo_count),
            StartOptions {
                priority: original.priority,
                limits: original.limits,
                skills: original.skills.clone(),
            },
        );
        task.retry_count = original.retry_count;
        task.redo_history = redo_history;
        Ok(self.admit(task))
    }

    fn admit(&self, task: Task) -> Uuid {
        let id = task.id;
        let priority = task.priority;
        self.tasks
            .lock()
            .expect("task map poisoned")
            .insert(id, task);
        self.enqueue_pending(id);
        tracing::info!(task_id = %id, priority = %priority, "Task queued");
        self.emit_status(id, TaskStatus::Queued);
        self.drain();
        id
    }

    // -- Dispatch --

    fn enqueue_pending(&self, id: Uuid) {
        let ranks: HashMap<Uuid, u8> = {
            let tasks = self.tasks.lock().expect("task map poisoned");
            tasks
                .values()
                .map(|t| (t.id, t.priority.dispatch_rank()))
                .collect()
        };
        let mut pending = self.pending.lock().expect("pending poisoned");
        pending.push(id);
        // Stable sort: within a priority, enqueue order survives.
        pending.sort_by_key(|p| ranks.get(p).copied().unwrap_or(TaskPriority::Normal.dispatch_rank()));
    }

    /// Promote queued tasks while capacity allows. Each promotion flips
    /// the record to running before its loop is spawned, so the running
    /// count can never overshoot `max_concurrent`.
    pub fn drain(&self) {
        loop {
            let promoted = {
                let mut tasks = self.tasks.lock().expect("task map poisoned");
                let running = tasks
                    .values()
                    .filter(|t| t.status == TaskStatus::Running)
                    .count();
                if running >= self.config.max_concurrent {
                    break;
                }
                let mut pending = self.pending.lock().expect("pending poisoned");
                if pending.is_empty() {
                    break;
                }
                let id = pending.remove(0);
                match tasks.get_mut(&id) {
                    Some(task) if task.status == TaskStatus::Queued => {
                        task.status = TaskStatus::Running;
                        let now = chrono::Utc::now().timestamp_millis();
                        task.start_time = Some(now);
                        task.last_activity_time = Some(now);
                        Some(id)
                    }
                    // Cancelled while queued (or otherwise moved on);
                    // skip and keep draining.
                    _ => None,
                }
            };

            if let Some(id) = promoted {
                tracing::info!(task_id = %id, "Task dispatched");
                self.emit_status(id, TaskStatus::Running);
                let this = self.strong();
                tokio::spawn(async move { this.run_task(id).await });
            }
        }
    }

    // -- Execution --

    async fn run_task(self: Arc<Self>, id: Uuid) {
        let (template_id, prompt, skills, limits) = match self.task(id) {
            Some(task) => (task.template_id, task.prompt, task.skills, task.limits),
            None => return,
        };
        let limits = self.effective_limits(&limits);

        // Sub-agent and sandbox come up before the first completion call.
        let agent = match self.deps.agent_factory.create(&template_id, &skills).await {
            Ok(agent) => agent,
            Err(e) => {
                tracing::error!(task_id = %id, "Sub-agent creation failed: {}", e);
                self.finish_task(id, Err(e)).await;
                return;
            }
        };
        let sandbox = match self.deps.sandbox_factory.create(self.deps.sandbox_kind).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                tracing::error!(task_id = %id, "Sandbox creation failed: {}", e);
                self.finish_task(
                    id,
                    Err(AgentError::CompletionFailed {
                        reason: e.to_string(),
                    }),
                )
                .await;
                return;
            }
        };

        self.deps.registry.install(id, Arc::clone(&sandbox)).await;
        self.agents
            .lock()
            .expect("agent map poisoned")
            .insert(id, Arc::clone(&agent));

        // Re-check for a cancel that raced task startup: the loop must
        // never run a cancelled task.
        if self.task(id).is_none_or(|t| t.status != TaskStatus::Running) {
            self.finish_task(id, Ok(None)).await;
            return;
        }

        let monitor = agent.subscribe();
        let watchdog = self.spawn_watchdog(id, Arc::clone(&agent), monitor, limits);
        self.deps.progress.start(id, "running");

        let outcome = self.pause_loop(id, &agent, &prompt).await;

        watchdog.abort();
        self.deps.progress.finish(id);
        self.finish_task(id, outcome).await;
    }

    /// Run the sub-agent through pause/resume cycles until it finishes,
    /// the task goes terminal, or it pauses with nothing to resume on.
    async fn pause_loop(
        &self,
        id: Uuid,
        agent: &Arc<dyn Agent>,
        prompt: &str,
    ) -> Result<Option<String>, AgentError> {
        // Task-context header: the preview tool reads the id back out of
        // the prompt to find this task's sandbox in the registry.
        let mut input = task_context_header(id, prompt);

        loop {
            let completion = agent.complete(&input).await?;
            match completion {
                Completion {
                    status: CompletionStatus::Ok,
                    text,
                } => return Ok(text),
                Completion {
                    status: CompletionStatus::Paused,
                    ..
                } => {
                    let status = self
                        .task(id)
                        .map(|t| t.status)
                        .unwrap_or(TaskStatus::Failed);
                    if matches!(status, TaskStatus::Cancelled | TaskStatus::Failed) {
                        return Ok(None);
                    }
                    let stashed = self
                        .pending_messages
                        .lock()
                        .expect("stash poisoned")
                        .remove(&id);
                    match stashed {
                        Some(next) => {
                            tracing::debug!(task_id = %id, "Resuming with steering input");
                            input = next;
                        }
                        // Paused with no refuel and no terminal mark:
                        // nothing can wake it, treat as terminal.
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Resolve the final status on the record, then run teardown and the
    /// single terminal injection.
    async fn finish_task(&self, id: Uuid, outcome: Result<Option<String>, AgentError>) {
        let (record, transitioned_here) = {
            let mut tasks = self.tasks.lock().expect("task map poisoned");
            let Some(task) = tasks.get_mut(&id) else {
                return;
            };
            let before = task.status;
            match outcome {
                Ok(Some(text)) if task.status == TaskStatus::Running => {
                    task.status = TaskStatus::Completed;
                    task.result = Some(text);
                }
                Ok(_) => {
                    if task.status == TaskStatus::Running {
                        task.status = TaskStatus::Failed;
                        task.error = Some("agent paused with no pending input".to_string());
                    }
                }
                Err(e) => {
                    if !task.status.is_terminal() {
                        task.status = TaskStatus::Failed;
                        task.error = Some(e.to_string());
                    }
                }
            }
            (task.clone(), task.status != before)
        };

        self.pending_messages
            .lock()
            .expect("stash poisoned")
            .remove(&id);
        // A cancel already announced its own transition.
        if transitioned_here {
            self.emit_status(id, record.status);
        }

        match record.status {
            TaskStatus::Completed => {
                self.setup_keep_alive(id, &record).await;
                // Re-read: keep-alive setup wrote the preview fields.
                let record = self.task(id).unwrap_or_else(|| record.clone());
                self.inject(
                    id,
                    InjectionKind::TaskResult,
                    injection::compose_completed(&record, self.injection_cfg.result_truncate_chars),
                );
            }
            TaskStatus::Failed => {
                self.dispose_agent(id);
                self.dispose_sandbox(id).await;
                self.inject(id, InjectionKind::TaskFailed, injection::compose_failed(&record));
            }
            TaskStatus::Cancelled => {
                self.dispose_agent(id);
                self.dispose_sandbox(id).await;
                self.inject(
                    id,
                    InjectionKind::TaskCancelled,
                    injection::compose_cancelled(&record),
                );
            }
            // Unreachable given the resolution above; nothing to announce.
            TaskStatus::Queued | TaskStatus::Running => {}
        }

        tracing::info!(task_id = %id, status = %record.status, "Task finished");
        self.drain();
    }

    /// Post-completion keep-alive: the sub-agent always survives for
    /// follow-up chat; the sandbox survives only when the result text
    /// published a non-local preview URL.
    async fn setup_keep_alive(&self, id: Uuid, record: &Task) {
        let preview = record
            .result
            .as_deref()
            .and_then(extract_preview_url);

        match preview {
            Some(url) => {
                {
                    let mut tasks = self.tasks.lock().expect("task map poisoned");
                    if let Some(task) = tasks.get_mut(&id) {
                        task.sandbox_url = Some(url.clone());
                        task.sandbox_alive = true;
                    }
                }
                tracing::info!(task_id = %id, url = %url, "Keeping sandbox alive for preview");
                self.arm_sandbox_timer(id);
            }
            None => {
                self.dispose_sandbox(id).await;
            }
        }

        {
            let mut tasks = self.tasks.lock().expect("task map poisoned");
            if let Some(task) = tasks.get_mut(&id) {
                task.agent_alive = true;
            }
        }
        self.arm_agent_timer(id);
    }

    // -- Keep-alive chat --

    async fn run_chat(self: Arc<Self>, id: Uuid, agent: Arc<dyn Agent>, message: String) {
        let limits = self
            .task(id)
            .map(|t| self.effective_limits(&t.limits))
            .unwrap_or_else(|| self.effective_limits(&ResourceLimits::default()));

        // Fresh monitor subscription for this chat only.
        let monitor = agent.subscribe();
        let watchdog = self.spawn_watchdog(id, Arc::clone(&agent), monitor, limits);

        let outcome = agent.complete(&message).await;
        watchdog.abort();

        let record = {
            let mut tasks = self.tasks.lock().expect("task map poisoned");
            let Some(task) = tasks.get_mut(&id) else {
                return;
            };
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Completed;
            }
            task.last_activity_time = Some(chrono::Utc::now().timestamp_millis());
            task.clone()
        };
        self.emit_status(id, record.status);

        match outcome {
            Ok(Completion {
                status: CompletionStatus::Ok,
                text,
            }) => {
                self.inject(
                    id,
                    InjectionKind::ChatResult,
                    injection::compose_chat_result(
                        &record,
                        text.as_deref().unwrap_or(""),
                        self.injection_cfg.result_truncate_chars,
                    ),
                );
            }
            Ok(Completion {
                status: CompletionStatus::Paused,
                ..
            }) => {
                self.inject(
                    id,
                    InjectionKind::ChatFailed,
                    injection::compose_chat_failed(&record, "agent paused before replying"),
                );
            }
            Err(e) => {
                tracing::warn!(task_id = %id, "Keep-alive chat failed: {}", e);
                self.inject(
                    id,
                    InjectionKind::ChatFailed,
                    injection::compose_chat_failed(&record, &e.to_string()),
                );
            }
        }

        // A chat re-entry grants the agent a fresh keep-alive window.
        if record.agent_alive {
            self.arm_agent_timer(id);
        }
    }

    // -- Watchdog --

    /// Monitor subscription consumer: counts usage against budgets,
    /// routes permission requests through the bridge, and enforces the
    /// idle timeout. Every event resets the idle deadline.
    fn spawn_watchdog(
        &self,
        id: Uuid,
        agent: Arc<dyn Agent>,
        mut monitor: mpsc::UnboundedReceiver<MonitorEvent>,
        limits: EffectiveLimits,
    ) -> JoinHandle<()> {
        let this = self.strong();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = monitor.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                    _ = tokio::time::sleep(limits.idle_timeout) => {
                        let note = format!(
                            "idle timeout: no activity for {}s",
                            limits.idle_timeout.as_secs()
                        );
                        if this.fail_if_running(id, &note) {
                            tracing::warn!(task_id = %id, "{}", note);
                            agent.interrupt(Some(&note)).await;
                        }
                        break;
                    }
                };

                this.touch_activity(id);
                match event {
                    MonitorEvent::ToolExecuted { call } => {
                        tracing::debug!(task_id = %id, tool = %call.name, "Tool executed");
                        let exceeded = this.bump_usage(id, |u| {
                            u.tool_calls += 1;
                            u.tool_calls >= limits.max_tool_calls
                        });
                        if exceeded && this.fail_if_running(id, "maxToolCalls limit") {
                            agent.interrupt(Some("maxToolCalls limit")).await;
                            break;
                        }
                    }
                    MonitorEvent::StepComplete => {
                        let exceeded = this.bump_usage(id, |u| {
                            u.steps += 1;
                            u.steps >= limits.max_steps
                        });
                        if exceeded && this.fail_if_running(id, "maxSteps limit") {
                            agent.interrupt(Some("maxSteps limit")).await;
                            break;
                        }
                    }
                    MonitorEvent::TokenUsage { tokens } => {
                        // Tokens are counted but never capped.
                        this.bump_usage(id, |u| {
                            u.total_tokens += tokens;
                            false
                        });
                    }
                    MonitorEvent::PermissionRequired { call, responder } => {
                        this.deps
                            .bridge
                            .handle(id, this.deps.sandbox_kind, call, responder);
                    }
                    MonitorEvent::ContextCompression { phase, summary } => {
                        this.deps.bus.send(&SseEvent::Phase {
                            name: format!("context_compression:{}", phase),
                            task_id: Some(id),
                            detail: summary,
                        });
                    }
                }
            }
        })
    }

    // -- Internals --

    fn effective_limits(&self, limits: &ResourceLimits) -> EffectiveLimits {
        EffectiveLimits {
            max_tool_calls: limits
                .max_tool_calls
                .unwrap_or(self.config.default_max_tool_calls),
            max_steps: limits.max_steps.unwrap_or(self.config.default_max_steps),
            idle_timeout: limits
                .idle_timeout()
                .unwrap_or(self.config.default_idle_timeout),
        }
    }

    fn touch_activity(&self, id: Uuid) {
        if let Some(task) = self.tasks.lock().expect("task map poisoned").get_mut(&id) {
            task.last_activity_time = Some(chrono::Utc::now().timestamp_millis());
        }
    }

    /// Apply `f` to the usage counters; returns `f`'s verdict (budget
    /// exceeded). Counters only ever grow.
    fn bump_usage(&self, id: Uuid, f: impl FnOnce(&mut crate::scheduler::task::ResourceUsage) -> bool) -> bool {
        let mut tasks = self.tasks.lock().expect("task map poisoned");
        match tasks.get_mut(&id) {
            Some(task) => f(&mut task.usage),
            None => false,
        }
    }

    /// Mark a running task failed. Leaves already-terminal records alone
    /// so a cancel and a watchdog firing together keep the first verdict.
    fn fail_if_running(&self, id: Uuid, error: &str) -> bool {
        let failed = {
            let mut tasks = self.tasks.lock().expect("task map poisoned");
            match tasks.get_mut(&id) {
                Some(task) if task.status == TaskStatus::Running => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(error.to_string());
                    true
                }
                _ => false,
            }
        };
        if failed {
            self.emit_status(id, TaskStatus::Failed);
        }
        failed
    }

    fn inject(&self, id: Uuid, kind: InjectionKind, message: String) {
        match self.injector.get() {
            Some(injector) => injector.enqueue(InjectionItem {
                message,
                task_id: id,
                kind,
            }),
            None => tracing::warn!(task_id = %id, "No injection queue wired; dropping {}", kind.as_str()),
        }
    }

    fn emit_status(&self, id: Uuid, status: TaskStatus) {
        self.deps.bus.send(&SseEvent::Phase {
            name: "task_status".to_string(),
            task_id: Some(id),
            detail: Some(status.to_string()),
        });
    }

    fn arm_agent_timer(&self, id: Uuid) {
        let this = self.strong();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.keep_alive.agent).await;
            tracing::debug!(task_id = %id, "Agent keep-alive expired");
            this.dispose_agent(id);
        });
        self.replace_timer(&self.agent_timers, id, handle);
    }

    fn arm_sandbox_timer(&self, id: Uuid) {
        let this = self.strong();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.keep_alive.sandbox).await;
            tracing::debug!(task_id = %id, "Sandbox keep-alive expired");
            this.dispose_sandbox(id).await;
        });
        self.replace_timer(&self.sandbox_timers, id, handle);
    }

    fn replace_timer(
        &self,
        timers: &Mutex<HashMap<Uuid, JoinHandle<()>>>,
        id: Uuid,
        handle: JoinHandle<()>,
    ) {
        if let Some(old) = timers.lock().expect("timer map poisoned").insert(id, handle) {
            old.abort();
        }
    }

    fn abort_timer(&self, timers: &Mutex<HashMap<Uuid, JoinHandle<()>>>, id: Uuid) {
        if let Some(handle) = timers.lock().expect("timer map poisoned").remove(&id) {
            handle.abort();
        }
    }
}

/// Prefix a sub-task prompt with the task-context header. The id echoed
/// here is how tools running inside the sub-agent (the sandbox preview
/// tool in particular) find their way back to this task's resources.
pub fn task_context_header(id: Uuid, prompt: &str) -> String {
    format!("[task-context] taskId={}\n\n{}", id, prompt)
}

/// Recover the task id from a prompt carrying the task-context header.
pub fn task_id_from_header(input: &str) -> Option<Uuid> {
    let rest = input.strip_prefix("[task-context] taskId=")?;
    let end = rest
        .find(|c: char| c.is_whitespace())
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Find a `[sandbox-preview](URL)` marker whose URL is not local.
fn extract_preview_url(text: &str) -> Option<String> {
    const MARKER: &str = "[sandbox-preview](";
    let start = text.find(MARKER)? + MARKER.len();
    let end = text[start..].find(')')?;
    let url = text[start..start + end].trim();
    if url.is_empty() || is_local_url(url) {
        return None;
    }
    Some(url.to_string())
}

fn is_local_url(url: &str) -> bool {
    let host = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    host.starts_with("localhost") || host.starts_with("127.0.0.1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_header_round_trips() {
        let id = Uuid::new_v4();
        let input = task_context_header(id, "do the thing");
        assert_eq!(task_id_from_header(&input), Some(id));
        assert!(input.ends_with("do the thing"));
        assert_eq!(task_id_from_header("no header at all"), None);
    }

    #[test]
    fn preview_marker_extraction() {
        assert_eq!(
            extract_preview_url("done! [sandbox-preview](https://box-1.example.dev:8080) enjoy"),
            Some("https://box-1.example.dev:8080".to_string())
        );
        assert_eq!(extract_preview_url("no marker here"), None);
        assert_eq!(extract_preview_url("[sandbox-preview]()"), None);
    }

    #[test]
    fn local_preview_urls_are_filtered() {
        assert_eq!(extract_preview_url("[sandbox-preview](http://localhost:3000)"), None);
        assert_eq!(extract_preview_url("[sandbox-preview](localhost:3000)"), None);
        assert_eq!(extract_preview_url("[sandbox-preview](http://127.0.0.1:8080)"), None);
        // A host that merely contains "localhost" deeper in is fine.
        assert_eq!(
            extract_preview_url("[sandbox-preview](https://notlocalhost.example.com)"),
            Some("https://notlocalhost.example.com".to_string())
        );
    }
}
