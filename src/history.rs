//! In-memory conversation transcript.
//!
//! Records user messages and parent-agent replies for `/api/history` and
//! the `/history` slash command. Durable persistence is a different
//! system's job; this store lives and dies with the process.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
pub struct HistoryStore {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, role: Role, text: impl Into<String>) {
        let mut entries = self.entries.lock().expect("history lock poisoned");
        entries.push(HistoryEntry {
            role,
            text: text.into(),
            at: Utc::now(),
        });
    }

    /// Most recent `limit` entries in chronological order; all when None.
    pub fn recent(&self, limit: Option<usize>) -> Vec<HistoryEntry> {
        let entries = self.entries.lock().expect("history lock poisoned");
        let skip = limit
            .map(|n| entries.len().saturating_sub(n))
            .unwrap_or(0);
        entries[skip..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("history lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
