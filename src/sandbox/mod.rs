//! Sandbox contract and per-task ownership registry.
//!
//! Concrete isolation backends (containers, remote VMs) live outside this
//! crate; the scheduler only needs to create a sandbox for a task, ask a
//! preview-capable one for a host URL, and dispose it. The registry
//! answers "which sandbox belongs to task X right now" for the preview
//! tool, which takes the task id from the prompt header the scheduler
//! writes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::SandboxError;

/// Isolation level of a sandbox. Remote sandboxes are fully isolated, so
/// the permission bridge auto-allows tool calls inside them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    Local,
    Remote,
}

impl SandboxKind {
    /// Whether this kind provides its own isolation boundary.
    pub fn is_isolated(&self) -> bool {
        matches!(self, Self::Remote)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl std::fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An isolated execution environment used by one sub-agent.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn kind(&self) -> SandboxKind;

    /// Run a shell command. Optional capability; the default refuses.
    async fn exec(&self, _cmd: &str) -> Result<String, SandboxError> {
        Err(SandboxError::ExecFailed {
            reason: format!("sandbox kind '{}' does not support exec", self.kind()),
        })
    }

    /// Public URL for a port inside the sandbox. Only remote/preview
    /// sandboxes implement this.
    async fn host_url(&self, _port: u16) -> Result<String, SandboxError> {
        Err(SandboxError::NoHostUrl {
            kind: self.kind().to_string(),
        })
    }

    /// Tear down the sandbox. Must be idempotent; errors are the
    /// implementation's to log.
    async fn dispose(&self);
}

/// Constructs sandboxes by kind.
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    async fn create(&self, kind: SandboxKind) -> Result<Arc<dyn Sandbox>, SandboxError>;
}

/// Who owns which sandbox right now, keyed by task id.
///
/// An entry is installed before the task's sub-agent starts and removed at
/// the end of the last activity that used the sandbox (task teardown or
/// keep-alive expiry).
#[derive(Default)]
pub struct SandboxRegistry {
    entries: RwLock<HashMap<Uuid, Arc<dyn Sandbox>>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn install(&self, task_id: Uuid, sandbox: Arc<dyn Sandbox>) {
        self.entries.write().await.insert(task_id, sandbox);
    }

    /// Remove and return the entry, if present. Safe to call twice.
    pub async fn remove(&self, task_id: Uuid) -> Option<Arc<dyn Sandbox>> {
        self.entries.write().await.remove(&task_id)
    }

    pub async fn get(&self, task_id: Uuid) -> Option<Arc<dyn Sandbox>> {
        self.entries.read().await.get(&task_id).cloned()
    }

    pub async fn contains(&self, task_id: Uuid) -> bool {
        self.entries.read().await.contains_key(&task_id)
    }

    /// Public URL for a port in the sandbox owned by `task_id`. This is
    /// the lookup behind the sandbox-preview tool, which recovers the
    /// task id from its prompt header.
    pub async fn host_url_for(&self, task_id: Uuid, port: u16) -> Result<String, SandboxError> {
        let sandbox = self
            .get(task_id)
            .await
            .ok_or(SandboxError::NotRegistered { task_id })?;
        sandbox.host_url(port).await
    }
}

/// A no-op in-process sandbox. The shipped default for local development;
/// it provides no isolation, which is exactly why the permission bridge
/// routes its shell commands through the approval flow.
pub struct NullSandbox {
    kind: SandboxKind,
}

impl NullSandbox {
    pub fn new(kind: SandboxKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Sandbox for NullSandbox {
    fn kind(&self) -> SandboxKind {
        self.kind
    }

    async fn dispose(&self) {}
}

/// Factory producing [`NullSandbox`] instances.
#[derive(Default)]
pub struct NullSandboxFactory;

#[async_trait]
impl SandboxFactory for NullSandboxFactory {
    async fn create(&self, kind: SandboxKind) -> Result<Arc<dyn Sandbox>, SandboxError> {
        Ok(Arc::new(NullSandbox::new(kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_install_get_remove() {
        let registry = SandboxRegistry::new();
        let task_id = Uuid::new_v4();
        let sandbox: Arc<dyn Sandbox> = Arc::new(NullSandbox::new(SandboxKind::Local));

        registry.install(task_id, sandbox).await;
        assert!(registry.contains(task_id).await);
        assert!(registry.get(task_id).await.is_some());

        assert!(registry.remove(task_id).await.is_some());
        // Second removal is a no-op.
        assert!(registry.remove(task_id).await.is_none());
        assert!(!registry.contains(task_id).await);
    }

    #[tokio::test]
    async fn host_url_lookup_distinguishes_missing_from_incapable() {
        let registry = SandboxRegistry::new();
        let task_id = Uuid::new_v4();

        // No sandbox registered at all.
        assert!(matches!(
            registry.host_url_for(task_id, 3000).await,
            Err(SandboxError::NotRegistered { .. })
        ));

        // Registered, but the kind has no host URLs.
        registry
            .install(task_id, Arc::new(NullSandbox::new(SandboxKind::Remote)))
            .await;
        assert!(matches!(
            registry.host_url_for(task_id, 3000).await,
            Err(SandboxError::NoHostUrl { .. })
        ));
    }

    #[tokio::test]
    async fn null_sandbox_refuses_optional_capabilities() {
        let sandbox = NullSandbox::new(SandboxKind::Local);
        assert!(sandbox.exec("ls").await.is_err());
        assert!(sandbox.host_url(3000).await.is_err());
    }

    #[test]
    fn remote_kind_is_isolated() {
        assert!(SandboxKind::Remote.is_isolated());
        assert!(!SandboxKind::Local.is_isolated());
    }
}
