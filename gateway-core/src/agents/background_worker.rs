//! Background task tracking.
//!
//! A managed alternative to ad-hoc `tokio::spawn` calls: each task gets a
//! name, a cancellation token, and a status slot in a shared `DashMap`, so
//! callers can poll progress or cancel a task by id instead of holding onto
//! a `JoinHandle` themselves.
//!
//! # Example
//!
//! ```rust,ignore
//! let worker = BackgroundWorker::new();
//!
//! worker.submit("seal-audit-day", || async move {
//!     seal_day().await
//! }).await;
//!
//! let status = worker.get_task_status("seal-audit-day").await;
//! worker.cancel("seal-audit-day").await;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

struct TaskInfo {
    task_id: String,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
    status: Arc<Mutex<TaskStatus>>,
}

/// Shared handle to a named-task registry; cloning shares the same map.
#[derive(Clone, Default)]
pub struct BackgroundWorker {
    tasks: Arc<DashMap<String, TaskInfo>>,
    root_token: CancellationToken,
}

impl BackgroundWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a new background task. Spawned immediately via `tokio::spawn`
    /// and tracked under `task_id` until cancelled, completed, or removed by
    /// [`Self::cleanup_finished_tasks`].
    pub async fn submit<F, Fut>(&self, task_id: impl Into<String>, work: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let task_id = task_id.into();
        let cancel_token = self.root_token.child_token();
        let cancel_token_clone = cancel_token.clone();

        let status = Arc::new(Mutex::new(TaskStatus::Running));
        let status_for_task = status.clone();
        let task_id_clone = task_id.clone();

        let handle = tokio::spawn(async move {
            let task_id = task_id_clone;
            tokio::select! {
                biased;

                () = cancel_token_clone.cancelled() => {
                    tracing::debug!(task_id = %task_id, "task cancelled");
                    *status_for_task.lock().await = TaskStatus::Cancelled;
                }
                result = work() => {
                    match result {
                        Ok(()) => {
                            tracing::debug!(task_id = %task_id, "task completed");
                            *status_for_task.lock().await = TaskStatus::Completed;
                        }
                        Err(e) => {
                            tracing::warn!(task_id = %task_id, error = %e, "task failed");
                            *status_for_task.lock().await = TaskStatus::Failed(e.to_string());
                        }
                    }
                }
            }
        });

        self.tasks.insert(
            task_id.clone(),
            TaskInfo {
                task_id,
                join_handle: Mutex::new(Some(handle)),
                cancellation_token: cancel_token,
                status,
            },
        );
    }

    /// Cancel a specific task and wait up to 5 seconds for it to unwind.
    pub async fn cancel(&self, task_id: &str) {
        let Some(task_info) = self.tasks.get(task_id) else {
            tracing::warn!(task_id, "task not found for cancellation");
            return;
        };
        task_info.cancellation_token.cancel();
        if let Some(handle) = task_info.join_handle.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }

    pub async fn status(&self, task_id: &str) -> TaskStatus {
        match self.tasks.get(task_id) {
            Some(task_info) => task_info.status.lock().await.clone(),
            None => TaskStatus::Pending,
        }
    }

    pub async fn all_statuses(&self) -> Vec<(String, TaskStatus)> {
        let mut out = Vec::with_capacity(self.tasks.len());
        for entry in self.tasks.iter() {
            out.push((entry.task_id.clone(), entry.status.lock().await.clone()));
        }
        out
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn has_task(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Drop completed/failed/cancelled entries so the map doesn't grow
    /// without bound across the gateway's lifetime.
    pub async fn cleanup_finished_tasks(&self) {
        let mut finished = Vec::new();
        for entry in self.tasks.iter() {
            if !matches!(*entry.status.lock().await, TaskStatus::Running | TaskStatus::Pending) {
                finished.push(entry.task_id.clone());
            }
        }
        for task_id in finished {
            self.tasks.remove(&task_id);
        }
    }

    /// Cancel every outstanding task and wait (up to 5s each) for shutdown.
    pub async fn shutdown(&self) {
        if self.tasks.is_empty() {
            return;
        }
        self.root_token.cancel();
        for entry in self.tasks.iter() {
            if let Some(handle) = entry.join_handle.lock().await.take() {
                let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
            }
        }
        tracing::info!("all background tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn submitted_task_completes() {
        let worker = BackgroundWorker::new();
        worker.submit("noop", || async { Ok(()) }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(worker.status("noop").await, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn failed_task_reports_error() {
        let worker = BackgroundWorker::new();
        worker.submit("boom", || async { anyhow::bail!("kaboom") }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(worker.status("boom").await, TaskStatus::Failed("kaboom".into()));
    }

    #[tokio::test]
    async fn cancel_stops_pending_task() {
        let worker = BackgroundWorker::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        worker
            .submit("long", move || async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                ran_clone.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        worker.cancel("long").await;
        assert_eq!(worker.status("long").await, TaskStatus::Cancelled);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unknown_task_status_is_pending() {
        let worker = BackgroundWorker::new();
        assert_eq!(worker.status("nope").await, TaskStatus::Pending);
        assert!(!worker.has_task("nope"));
    }
}
