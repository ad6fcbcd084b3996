//! Tracking for cancelable one-shot background tasks
//!
//! Holds the JoinHandle of each scheduled reaper so it can be aborted when
//! its resource is torn down early.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Keyed set of background tasks
#[derive(Debug)]
pub struct TaskTracker {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a task, aborting any previous task under the same key
    pub fn register(&self, key: String, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(old_handle) = tasks.remove(&key) {
                old_handle.abort();
            }
            tasks.insert(key, handle);
        }
    }

    /// Unregister and abort a task
    pub fn unregister(&self, key: &str) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(handle) = tasks.remove(key) {
                handle.abort();
            }
        }
    }

    /// Forget a task that is finishing on its own. Must be called by the
    /// task itself instead of `unregister`, which would abort it.
    pub fn complete(&self, key: &str) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.remove(key);
        }
    }

    pub fn abort_all(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleeper() -> JoinHandle<()> {
        tokio::spawn(async { tokio::time::sleep(Duration::from_secs(10)).await })
    }

    async fn finished(abort: &tokio::task::AbortHandle) -> bool {
        for _ in 0..100 {
            if abort.is_finished() {
                return true;
            }
            tokio::task::yield_now().await;
        }
        false
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let tracker = TaskTracker::new();
        let handle = sleeper();
        let abort = handle.abort_handle();

        tracker.register("reaper-1".to_string(), handle);
        assert_eq!(tracker.len(), 1);

        tracker.unregister("reaper-1");
        assert!(tracker.is_empty());
        assert!(finished(&abort).await);
    }

    #[tokio::test]
    async fn test_replacing_task_aborts_old() {
        let tracker = TaskTracker::new();
        let first = sleeper();
        let first_abort = first.abort_handle();
        tracker.register("reaper-1".to_string(), first);
        tracker.register("reaper-1".to_string(), sleeper());

        assert_eq!(tracker.len(), 1);
        assert!(finished(&first_abort).await);
    }

    #[tokio::test]
    async fn test_complete_does_not_abort() {
        let tracker = TaskTracker::new();
        let handle = sleeper();
        let abort = handle.abort_handle();
        tracker.register("reaper-1".to_string(), handle);

        tracker.complete("reaper-1");
        assert!(tracker.is_empty());
        tokio::task::yield_now().await;
        assert!(!abort.is_finished());
        abort.abort();
    }

    #[tokio::test]
    async fn test_abort_all() {
        let tracker = TaskTracker::new();
        tracker.register("a".to_string(), sleeper());
        tracker.register("b".to_string(), sleeper());
        tracker.abort_all();
        assert!(tracker.is_empty());
    }
}
