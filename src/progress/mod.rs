//! Per-task progress heartbeats.
//!
//! Orthogonal to scheduler state: each active task gets a periodic timer
//! that re-emits its latest progress record to the SSE bus, so clients
//! see signs of life even when a sub-agent is quietly grinding. Best
//! effort by design; nothing depends on heartbeat timing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{EventBus, SseEvent};

/// Latest known progress for one task.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressRecord {
    pub task_id: Uuid,
    pub percent: u8,
    pub stage: String,
    pub message: Option<String>,
}

struct Entry {
    record: ProgressRecord,
    heartbeat: JoinHandle<()>,
}

/// Tracks progress records and their heartbeat timers.
pub struct ProgressTracker {
    interval: Duration,
    bus: EventBus,
    entries: Arc<Mutex<HashMap<Uuid, Entry>>>,
}

impl ProgressTracker {
    pub fn new(interval: Duration, bus: EventBus) -> Self {
        Self {
            interval,
            bus,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Begin tracking a task. Replaces any previous record and timer.
    pub fn start(&self, task_id: Uuid, stage: impl Into<String>) {
        let record = ProgressRecord {
            task_id,
            percent: 0,
            stage: stage.into(),
            message: None,
        };
        self.emit(&record);

        let heartbeat = {
            let entries = Arc::clone(&self.entries);
            let bus = self.bus.clone();
            let interval = self.interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // The immediate first tick would duplicate the emit above.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let record = {
                        let entries = entries.lock().expect("progress lock poisoned");
                        match entries.get(&task_id) {
                            Some(entry) => entry.record.clone(),
                            None => break,
                        }
                    };
                    bus.send(&SseEvent::Progress {
                        task_id: record.task_id,
                        percent: record.percent,
                        stage: record.stage.clone(),
                        message: record.message.clone(),
                    });
                }
            })
        };

        let mut entries = self.entries.lock().expect("progress lock poisoned");
        if let Some(old) = entries.insert(task_id, Entry { record, heartbeat }) {
            old.heartbeat.abort();
        }
    }

    /// Update the record and emit once immediately.
    pub fn update(
        &self,
        task_id: Uuid,
        percent: u8,
        stage: impl Into<String>,
        message: Option<String>,
    ) {
        let record = {
            let mut entries = self.entries.lock().expect("progress lock poisoned");
            let Some(entry) = entries.get_mut(&task_id) else {
                return;
            };
            entry.record.percent = percent.min(100);
            entry.record.stage = stage.into();
            entry.record.message = message;
            entry.record.clone()
        };
        self.emit(&record);
    }

    /// Stop the heartbeat and drop the record.
    pub fn finish(&self, task_id: Uuid) {
        let entry = {
            let mut entries = self.entries.lock().expect("progress lock poisoned");
            entries.remove(&task_id)
        };
        if let Some(entry) = entry {
            entry.heartbeat.abort();
        }
    }

    pub fn snapshots(&self) -> Vec<ProgressRecord> {
        let entries = self.entries.lock().expect("progress lock poisoned");
        let mut list: Vec<ProgressRecord> =
            entries.values().map(|e| e.record.clone()).collect();
        list.sort_by_key(|r| r.task_id);
        list
    }

    fn emit(&self, record: &ProgressRecord) {
        self.bus.send(&SseEvent::Progress {
            task_id: record.task_id,
            percent: record.percent,
            stage: record.stage.clone(),
            message: record.message.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(interval_ms: u64) -> (ProgressTracker, EventBus) {
        let bus = EventBus::default();
        (
            ProgressTracker::new(Duration::from_millis(interval_ms), bus.clone()),
            bus,
        )
    }

    #[tokio::test]
    async fn start_emits_initial_record() {
        let (tracker, bus) = tracker(60_000);
        let mut rx = bus.subscribe();
        let task_id = Uuid::new_v4();

        tracker.start(task_id, "booting");

        let event: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(event["type"], "progress");
        assert_eq!(event["data"]["stage"], "booting");
        assert_eq!(event["data"]["percent"], 0);
        tracker.finish(task_id);
    }

    #[tokio::test]
    async fn update_emits_once_and_clamps() {
        let (tracker, bus) = tracker(60_000);
        let task_id = Uuid::new_v4();
        tracker.start(task_id, "working");

        let mut rx = bus.subscribe();
        tracker.update(task_id, 250, "late", Some("almost".to_string()));

        let event: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(event["data"]["percent"], 100);
        assert_eq!(event["data"]["stage"], "late");
        tracker.finish(task_id);
    }

    #[tokio::test]
    async fn heartbeat_fires_while_active() {
        let (tracker, bus) = tracker(20);
        let task_id = Uuid::new_v4();
        let mut rx = bus.subscribe();
        tracker.start(task_id, "grinding");

        // Initial emit plus at least one heartbeat.
        let mut seen = 0;
        for _ in 0..2 {
            let event: serde_json::Value =
                serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(event["type"], "progress");
            seen += 1;
        }
        assert_eq!(seen, 2);
        tracker.finish(task_id);
    }

    #[tokio::test]
    async fn finish_removes_record() {
        let (tracker, _bus) = tracker(60_000);
        let task_id = Uuid::new_v4();
        tracker.start(task_id, "x");
        assert_eq!(tracker.snapshots().len(), 1);
        tracker.finish(task_id);
        assert!(tracker.snapshots().is_empty());
        // Updating a finished task is a no-op.
        tracker.update(task_id, 50, "gone", None);
        assert!(tracker.snapshots().is_empty());
    }
}
