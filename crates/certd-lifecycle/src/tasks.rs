//! Tracking for in-flight issuance and renewal tasks
//!
//! Exchange tasks are fire-and-forget; their JoinHandles are kept here,
//! keyed by domain, so the system can observe how many exchanges are in
//! flight. There is no cancellation: a started exchange runs to completion
//! or failure.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Tracks background exchange tasks per domain
pub struct TaskTracker {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register the exchange task for a domain.
    ///
    /// The claim protocol guarantees at most one live exchange per domain,
    /// so a replaced handle always belongs to a finished task.
    pub fn register(&self, domain: String, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert(domain, handle);
        }
    }

    /// Whether an exchange for the domain is still running
    pub fn is_running(&self, domain: &str) -> bool {
        self.tasks
            .lock()
            .map(|tasks| tasks.get(domain).is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Number of exchanges currently in flight
    pub fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .map(|tasks| tasks.values().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}
