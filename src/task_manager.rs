//! Owns the shutdown signal and the handles of every long-running task.
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A centralized manager for the application's background tasks.
///
/// Tasks subscribe to a `watch` channel and are expected to return once it
/// flips to `true`. `shutdown` flips it and waits for them, aborting any task
/// that outlives the grace period.
#[derive(Clone, Debug)]
pub struct TaskManager {
    handles: Arc<Mutex<Vec<(&'static str, JoinHandle<()>)>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            handles: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Spawns a named task and keeps its handle.
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(task_name = name, "Spawning task");
        let handle = tokio::spawn(future);
        match self.handles.lock() {
            Ok(mut handles) => handles.push((name, handle)),
            Err(poisoned) => poisoned.into_inner().push((name, handle)),
        }
    }

    /// Returns a receiver that observes the shutdown signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    #[cfg(test)]
    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Signals every task to stop without waiting for them.
    pub fn trigger_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Signals shutdown and waits up to `grace` for all tasks to finish.
    pub async fn shutdown(self, grace: Duration) {
        self.trigger_shutdown();
        let handles: Vec<_> = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        info!("Waiting for {} tasks to complete...", handles.len());

        let task_names: Vec<&'static str> = handles.iter().map(|(name, _)| *name).collect();
        let aborts: Vec<_> = handles.iter().map(|(_, h)| h.abort_handle()).collect();

        match tokio::time::timeout(grace, join_all(handles.into_iter().map(|(_, h)| h))).await {
            Ok(results) => {
                for (task_name, result) in task_names.iter().zip(results) {
                    match result {
                        Ok(()) => debug!(task_name, "Task shut down gracefully."),
                        Err(e) => error!(task_name, error = %e, "Task failed during shutdown."),
                    }
                }
                info!("All tasks shut down.");
            }
            Err(_) => {
                warn!(tasks = ?task_names, "Tasks did not stop within {:?}, aborting", grace);
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }
}
