//! Ephemeral upload progress.
//!
//! Progress lives only in memory, keyed by task id.  Entries that reached a
//! terminal state (`completed` or `failed`) expire after a TTL; expired
//! entries are swept whenever a new task starts and by a periodic reaper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

/// Lifecycle of an upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Starting,
    Uploading,
    Completed,
    Failed,
    /// Unknown or expired task id.
    NotFound,
}

impl ProgressStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Failed)
    }
}

/// What clients see for a task.
#[derive(Debug, Clone, PartialEq, Serialize, utoipa::ToSchema)]
pub struct ProgressRecord {
    pub status: ProgressStatus,
    /// Percent complete, 0 to 100.
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    /// File id of the stored record once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressRecord {
    fn not_found() -> Self {
        Self {
            status: ProgressStatus::NotFound,
            progress: 0.0,
            filename: None,
            file_size: None,
            file_id: None,
            error: None,
        }
    }
}

struct Entry {
    record: ProgressRecord,
    finished_at: Option<Instant>,
}

/// In-memory progress map with TTL on finished entries.
pub struct ProgressTracker {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl ProgressTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Fresh task id for `owner`.
    pub fn new_task_id(owner: &str) -> String {
        format!("{}_{}", owner, uuid::Uuid::new_v4().simple())
    }

    /// Register a task in the `starting` state.
    pub fn start(&self, task_id: &str, filename: &str, file_size: u64) {
        self.sweep();
        let mut entries = self.entries.lock().expect("mutex poisoned");
        entries.insert(
            task_id.to_string(),
            Entry {
                record: ProgressRecord {
                    status: ProgressStatus::Starting,
                    progress: 0.0,
                    filename: Some(filename.to_string()),
                    file_size: Some(file_size),
                    file_id: None,
                    error: None,
                },
                finished_at: None,
            },
        );
    }

    pub fn set_uploading(&self, task_id: &str) {
        self.with_entry(task_id, |e| e.record.status = ProgressStatus::Uploading);
    }

    /// Record `sent` of `total` bytes pushed.
    pub fn update(&self, task_id: &str, sent: u64, total: u64) {
        let percent = if total > 0 {
            (sent as f64 / total as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        self.with_entry(task_id, |e| {
            if !e.record.status.is_terminal() {
                e.record.progress = percent;
            }
        });
    }

    pub fn complete(&self, task_id: &str, file_id: &str) {
        self.with_entry(task_id, |e| {
            e.record.status = ProgressStatus::Completed;
            e.record.progress = 100.0;
            e.record.file_id = Some(file_id.to_string());
            e.finished_at = Some(Instant::now());
        });
    }

    pub fn fail(&self, task_id: &str, error: &str) {
        self.with_entry(task_id, |e| {
            e.record.status = ProgressStatus::Failed;
            e.record.progress = 0.0;
            e.record.error = Some(error.to_string());
            e.finished_at = Some(Instant::now());
        });
    }

    /// Current record, or a `not_found` record for unknown ids.
    pub fn get(&self, task_id: &str) -> ProgressRecord {
        let entries = self.entries.lock().expect("mutex poisoned");
        entries
            .get(task_id)
            .map(|e| e.record.clone())
            .unwrap_or_else(ProgressRecord::not_found)
    }

    /// Drop finished entries older than the TTL. Returns how many went.
    pub fn sweep(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.entries.lock().expect("mutex poisoned");
        let before = entries.len();
        entries.retain(|_, e| e.finished_at.map_or(true, |t| t.elapsed() < ttl));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Swept {} finished progress entries", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep every `interval` until the runtime shuts down.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracker.sweep();
            }
        })
    }

    fn with_entry(&self, task_id: &str, f: impl FnOnce(&mut Entry)) {
        let mut entries = self.entries.lock().expect("mutex poisoned");
        if let Some(entry) = entries.get_mut(task_id) {
            f(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let tracker = ProgressTracker::new(Duration::from_secs(60));
        tracker.start("u1_a", "a.bin", 200);
        assert_eq!(tracker.get("u1_a").status, ProgressStatus::Starting);

        tracker.set_uploading("u1_a");
        tracker.update("u1_a", 50, 200);
        let rec = tracker.get("u1_a");
        assert_eq!(rec.status, ProgressStatus::Uploading);
        assert_eq!(rec.progress, 25.0);

        tracker.complete("u1_a", "file-1");
        let rec = tracker.get("u1_a");
        assert_eq!(rec.status, ProgressStatus::Completed);
        assert_eq!(rec.progress, 100.0);
        assert_eq!(rec.file_id.as_deref(), Some("file-1"));

        // Late callbacks do not rewind a finished task.
        tracker.update("u1_a", 10, 200);
        assert_eq!(tracker.get("u1_a").progress, 100.0);
    }

    #[test]
    fn test_unknown_task_is_not_found() {
        let tracker = ProgressTracker::new(Duration::from_secs(60));
        let rec = tracker.get("nobody_123");
        assert_eq!(rec.status, ProgressStatus::NotFound);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["status"], "not_found");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_failed_records_error() {
        let tracker = ProgressTracker::new(Duration::from_secs(60));
        tracker.start("t", "x", 1);
        tracker.fail("t", "boom");
        let rec = tracker.get("t");
        assert_eq!(rec.status, ProgressStatus::Failed);
        assert_eq!(rec.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_finished_entries_expire_on_next_start() {
        let tracker = ProgressTracker::new(Duration::ZERO);
        tracker.start("done", "a", 1);
        tracker.complete("done", "f");
        tracker.start("running", "b", 1);
        tracker.start("other", "c", 1);
        assert_eq!(tracker.get("done").status, ProgressStatus::NotFound);
        // Unfinished entries never expire.
        assert_eq!(tracker.get("running").status, ProgressStatus::Starting);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_task_id_shape() {
        let id = ProgressTracker::new_task_id("user42");
        assert!(id.starts_with("user42_"));
        assert_eq!(id.len(), "user42_".len() + 32);
        assert_ne!(id, ProgressTracker::new_task_id("user42"));
    }

    #[tokio::test]
    async fn test_reaper_sweeps_in_background() {
        let tracker = Arc::new(ProgressTracker::new(Duration::ZERO));
        tracker.start("t", "a", 1);
        tracker.fail("t", "x");
        let handle = tracker.spawn_reaper(Duration::from_millis(5));
        for _ in 0..100 {
            if tracker.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();
        assert!(tracker.is_empty());
    }
}
