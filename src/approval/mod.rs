//! Tool-approval registry and the permission bridge.
//!
//! Every `PermissionRequired` event from a sub-agent lands in the bridge,
//! which either answers immediately (isolated sandbox, or a shell command
//! the safe-command policy clears) or parks the request here and fans an
//! `approval_needed` event out to clients. The human decision comes back
//! through `decide`, looked up by permission id. Nothing in this module
//! blocks the scheduler.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::agent::{PermissionDecision, PermissionResponder, ToolCallInfo};
use crate::bus::{EventBus, SseEvent};
use crate::safety::CommandPolicy;
use crate::sandbox::SandboxKind;

/// A tool call parked until a human decides.
pub struct PendingApproval {
    pub permission_id: String,
    pub task_id: Option<Uuid>,
    pub call: ToolCallInfo,
    pub requested_at: DateTime<Utc>,
    responder: PermissionResponder,
}

/// Serializable view for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalSnapshot {
    pub permission_id: String,
    pub task_id: Option<Uuid>,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub requested_at: DateTime<Utc>,
}

/// Registry of pending approvals, keyed by permission id.
#[derive(Default)]
pub struct ApprovalManager {
    pending: Mutex<HashMap<String, PendingApproval>>,
}

impl ApprovalManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, approval: PendingApproval) {
        let mut pending = self.pending.lock().expect("approval lock poisoned");
        pending.insert(approval.permission_id.clone(), approval);
    }

    /// Resolve a pending approval. Returns false for unknown ids.
    pub fn decide(&self, permission_id: &str, decision: PermissionDecision, note: Option<String>) -> bool {
        let entry = {
            let mut pending = self.pending.lock().expect("approval lock poisoned");
            pending.remove(permission_id)
        };
        let Some(entry) = entry else {
            return false;
        };

        tracing::info!(
            permission_id = %permission_id,
            tool = %entry.call.name,
            decision = ?decision,
            "Approval decided"
        );
        entry.responder.respond(decision, note);
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("approval lock poisoned").len()
    }

    pub fn snapshots(&self) -> Vec<ApprovalSnapshot> {
        let pending = self.pending.lock().expect("approval lock poisoned");
        let mut list: Vec<ApprovalSnapshot> = pending
            .values()
            .map(|p| ApprovalSnapshot {
                permission_id: p.permission_id.clone(),
                task_id: p.task_id,
                tool_name: p.call.name.clone(),
                input: p.call.input.clone(),
                requested_at: p.requested_at,
            })
            .collect();
        list.sort_by_key(|s| s.requested_at);
        list
    }
}

/// Tool name treated as the shell-exec tool by the auto-allow policy.
pub const SHELL_TOOL: &str = "shell";

/// Routes permission requests: auto-allow, or park + announce.
pub struct PermissionBridge {
    approvals: std::sync::Arc<ApprovalManager>,
    policy: CommandPolicy,
    bus: EventBus,
}

impl PermissionBridge {
    pub fn new(
        approvals: std::sync::Arc<ApprovalManager>,
        policy: CommandPolicy,
        bus: EventBus,
    ) -> Self {
        Self {
            approvals,
            policy,
            bus,
        }
    }

    /// Handle one `PermissionRequired` event. Synchronous and
    /// non-blocking: responds inline or registers and returns.
    pub fn handle(
        &self,
        task_id: Uuid,
        sandbox_kind: SandboxKind,
        call: ToolCallInfo,
        responder: PermissionResponder,
    ) {
        if sandbox_kind.is_isolated() {
            tracing::debug!(
                task_id = %task_id,
                tool = %call.name,
                "Auto-allowing tool call in isolated sandbox"
            );
            responder.respond(
                PermissionDecision::Allow,
                Some(format!("auto-approved: {} sandbox is isolated", sandbox_kind)),
            );
            return;
        }

        if call.name == SHELL_TOOL && self.policy.is_safe(&call.input) {
            tracing::debug!(task_id = %task_id, "Auto-allowing safe shell command");
            responder.respond(
                PermissionDecision::Allow,
                Some("auto-approved: command matches safe policy".to_string()),
            );
            return;
        }

        let permission_id = Uuid::new_v4().to_string();
        let event = SseEvent::ApprovalNeeded {
            permission_id: permission_id.clone(),
            task_id: Some(task_id),
            tool_name: call.name.clone(),
            input: call.input.clone(),
        };
        self.approvals.add(PendingApproval {
            permission_id,
            task_id: Some(task_id),
            call,
            requested_at: Utc::now(),
            responder,
        });
        self.bus.send(&event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn call(name: &str, input: serde_json::Value) -> ToolCallInfo {
        ToolCallInfo {
            name: name.to_string(),
            input,
        }
    }

    fn bridge() -> (Arc<ApprovalManager>, PermissionBridge, EventBus) {
        let approvals = Arc::new(ApprovalManager::new());
        let bus = EventBus::default();
        let bridge = PermissionBridge::new(
            Arc::clone(&approvals),
            CommandPolicy::default(),
            bus.clone(),
        );
        (approvals, bridge, bus)
    }

    #[tokio::test]
    async fn safe_shell_command_auto_allows() {
        let (approvals, bridge, _bus) = bridge();
        let (responder, rx) = PermissionResponder::channel();

        bridge.handle(
            Uuid::new_v4(),
            SandboxKind::Local,
            call(SHELL_TOOL, json!({ "command": "git status" })),
            responder,
        );

        let reply = rx.await.unwrap();
        assert_eq!(reply.decision, PermissionDecision::Allow);
        assert!(reply.note.unwrap().contains("safe policy"));
        assert_eq!(approvals.pending_count(), 0);
    }

    #[tokio::test]
    async fn isolated_sandbox_auto_allows_anything() {
        let (approvals, bridge, _bus) = bridge();
        let (responder, rx) = PermissionResponder::channel();

        bridge.handle(
            Uuid::new_v4(),
            SandboxKind::Remote,
            call(SHELL_TOOL, json!({ "command": "rm -rf /" })),
            responder,
        );

        let reply = rx.await.unwrap();
        assert_eq!(reply.decision, PermissionDecision::Allow);
        assert!(reply.note.unwrap().contains("isolated"));
        assert_eq!(approvals.pending_count(), 0);
    }

    #[tokio::test]
    async fn unsafe_command_parks_and_announces() {
        let (approvals, bridge, bus) = bridge();
        let mut events = bus.subscribe();
        let (responder, mut rx) = PermissionResponder::channel();
        let task_id = Uuid::new_v4();

        bridge.handle(
            task_id,
            SandboxKind::Local,
            call(SHELL_TOOL, json!({ "command": "rm -rf /tmp/x" })),
            responder,
        );

        // Parked, not answered.
        assert_eq!(approvals.pending_count(), 1);
        assert!(rx.try_recv().is_err());

        let event: serde_json::Value =
            serde_json::from_str(&events.recv().await.unwrap()).unwrap();
        assert_eq!(event["type"], "approval_needed");
        let permission_id = event["data"]["permission_id"].as_str().unwrap().to_string();

        // Human denies.
        assert!(approvals.decide(&permission_id, PermissionDecision::Deny, None));
        let reply = rx.await.unwrap();
        assert_eq!(reply.decision, PermissionDecision::Deny);
        assert_eq!(approvals.pending_count(), 0);
    }

    #[test]
    fn decide_unknown_id_returns_false() {
        let approvals = ApprovalManager::new();
        assert!(!approvals.decide("nope", PermissionDecision::Allow, None));
    }

    #[tokio::test]
    async fn non_shell_tool_always_needs_approval_locally() {
        let (approvals, bridge, _bus) = bridge();
        let (responder, _rx) = PermissionResponder::channel();

        bridge.handle(
            Uuid::new_v4(),
            SandboxKind::Local,
            call("write_file", json!({ "path": "a.txt" })),
            responder,
        );
        assert_eq!(approvals.pending_count(), 1);
    }
}
