//! Tracking of long-lived background tasks
//!
//! Keeps the JoinHandles of the tunnel accept loop and the session reaper
//! so they can be aborted on shutdown.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::debug;

/// Named background tasks owned by the control plane
#[derive(Debug, Default)]
pub struct TaskTracker {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a task under `name`, aborting any previous task with that name
    pub fn register(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        let name = name.into();
        if let Some(old_handle) = self.lock().insert(name.clone(), handle) {
            debug!(task = %name, "Replacing tracked task");
            old_handle.abort();
        }
    }

    /// Abort every tracked task; returns how many were still running
    pub fn abort_all(&self) -> usize {
        let tasks: Vec<(String, JoinHandle<()>)> = self.lock().drain().collect();
        let mut running = 0;
        for (name, handle) in tasks {
            if !handle.is_finished() {
                running += 1;
                debug!(task = %name, "Aborting task");
            }
            handle.abort();
        }
        running
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
