//! Error taxonomy for the orchestrator.
//!
//! Scheduler-internal failures (resource limits, idle timeouts, sub-agent
//! errors) terminate the owning task and are recorded on its record; they
//! are never raised to callers. The types here cover everything that IS
//! surfaced: boundary validation, auth, lookups, wrong-state operations,
//! and component wiring.

use uuid::Uuid;

/// Top-level error type aggregating all domains.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Configuration resolution failures (malformed env values, missing
/// required settings). Fatal at startup, never at runtime.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("missing required setting: {name}")]
    Missing { name: String },
}

/// Malformed request at an external boundary. Maps to HTTP 400.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// Missing or invalid bearer token. Maps to HTTP 401.
#[derive(Debug, thiserror::Error)]
#[error("missing or invalid token")]
pub struct AuthError;

/// Unknown task or permission id. Maps to HTTP 404, or `{ok:false}` when
/// the caller is a tool.
#[derive(Debug, thiserror::Error)]
pub enum NotFoundError {
    #[error("unknown task: {id}")]
    Task { id: Uuid },

    #[error("unknown permission request: {id}")]
    Permission { id: String },
}

/// Operation not permitted in the task's current status.
#[derive(Debug, thiserror::Error)]
#[error("状态 {status}, 无法{operation}")]
pub struct StateError {
    /// Display form of the task's current status.
    pub status: String,
    /// Human label of the refused operation.
    pub operation: String,
}

/// Exception raised by a sub-agent or the parent agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent completion failed: {reason}")]
    CompletionFailed { reason: String },

    #[error("agent stream failed: {reason}")]
    StreamFailed { reason: String },
}

/// Sandbox construction or disposal failure. Disposal errors are logged
/// and swallowed at the call sites (disposal is best-effort).
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to create sandbox of kind '{kind}': {reason}")]
    CreationFailed { kind: String, reason: String },

    #[error("sandbox exec failed: {reason}")]
    ExecFailed { reason: String },

    #[error("sandbox of kind '{kind}' does not expose host URLs")]
    NoHostUrl { kind: String },

    #[error("no sandbox registered for task {task_id}")]
    NotRegistered { task_id: Uuid },
}
