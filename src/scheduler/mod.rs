//! Background sub-task scheduling.
//!
//! The runner owns every task record for the process lifetime and drives
//! each running task through a pause/resume loop against its sub-agent,
//! with watchdogs for idle timeouts and resource budgets, keep-alive
//! windows after completion, and exactly one result injection per
//! terminal transition.

pub mod runner;
pub mod task;

pub use runner::{RunnerDeps, TaskRunner, task_context_header, task_id_from_header};
pub use task::{
    ResourceLimits, ResourceUsage, StartOptions, Task, TaskPriority, TaskSnapshot, TaskStatus,
};
