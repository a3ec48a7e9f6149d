//! Tracking of background provisioning work.
//!
//! Creating an instance returns before its disk is cloned. The clone runs as
//! a tokio task registered here, so callers can poll its status, wait for it
//! and see why it failed instead of the error vanishing into a log.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::Result;

/// Outcome of a provisioning task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProvisionStatus {
    InProgress,
    Completed,
    Failed { reason: String },
}

impl ProvisionStatus {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, ProvisionStatus::InProgress)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ProvisionStatus::Failed { .. })
    }
}

struct ProvisionTask {
    status: watch::Receiver<ProvisionStatus>,
    handle: JoinHandle<()>,
}

/// Status as last published, or `Failed` if the task ended without publishing.
fn current_status(rx: &watch::Receiver<ProvisionStatus>) -> ProvisionStatus {
    let status = rx.borrow().clone();
    if status.is_in_progress() && rx.has_changed().is_err() {
        return ProvisionStatus::Failed {
            reason: "provisioning task ended without a result".to_string(),
        };
    }
    status
}

/// Registry of provisioning tasks keyed by instance id.
#[derive(Clone, Default)]
pub struct ProvisionTracker {
    tasks: Arc<RwLock<HashMap<String, ProvisionTask>>>,
    source_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ProvisionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock serializing work that reads the disk of `source_id`.
    ///
    /// Locks nobody holds any more are dropped from the map on each call.
    pub async fn source_lock(&self, source_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.source_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(source_id.to_string()).or_default().clone()
    }

    /// Run `work` in the background as the provisioning task of `instance_id`.
    pub async fn spawn<F>(&self, instance_id: &str, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(ProvisionStatus::InProgress);

        let id = instance_id.to_string();
        let handle = tokio::spawn(async move {
            let status = match work.await {
                Ok(()) => {
                    info!(instance_id = %id, "Provisioning completed");
                    ProvisionStatus::Completed
                }
                Err(e) => {
                    error!(instance_id = %id, error = %e, "Provisioning failed");
                    ProvisionStatus::Failed { reason: e.to_string() }
                }
            };
            tx.send_replace(status);
        });

        self.tasks
            .write()
            .await
            .insert(instance_id.to_string(), ProvisionTask { status: rx, handle });
    }

    /// Current status, `None` if nothing was ever provisioned under `instance_id`.
    pub async fn status(&self, instance_id: &str) -> Option<ProvisionStatus> {
        self.tasks.read().await.get(instance_id).map(|t| current_status(&t.status))
    }

    /// Wait for the task of `instance_id` to finish and return its outcome.
    ///
    /// Any number of callers may wait at once. Returns `None` if the task is
    /// forgotten while waiting.
    pub async fn wait(&self, instance_id: &str) -> Option<ProvisionStatus> {
        let mut rx = self.tasks.read().await.get(instance_id)?.status.clone();

        if rx.wait_for(|status| !status.is_in_progress()).await.is_err() {
            debug!(instance_id = %instance_id, "Provisioning task ended without a result");
        }

        self.status(instance_id).await
    }

    /// Drop the record of `instance_id`, aborting the task if still running.
    pub async fn forget(&self, instance_id: &str) {
        if let Some(task) = self.tasks.write().await.remove(instance_id) {
            task.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;

    #[tokio::test]
    async fn test_completed_task() {
        let tracker = ProvisionTracker::new();
        tracker.spawn("vm-1", async { Ok(()) }).await;

        assert_eq!(tracker.wait("vm-1").await, Some(ProvisionStatus::Completed));
        assert_eq!(tracker.status("vm-1").await, Some(ProvisionStatus::Completed));
    }

    #[tokio::test]
    async fn test_failed_task_keeps_reason() {
        let tracker = ProvisionTracker::new();
        tracker
            .spawn("vm-1", async { Err(DriverError::Internal("disk full".to_string())) })
            .await;

        match tracker.wait("vm-1").await {
            Some(ProvisionStatus::Failed { reason }) => assert!(reason.contains("disk full")),
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_in_progress_until_released() {
        let tracker = ProvisionTracker::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tracker
            .spawn("vm-1", async move {
                let _ = rx.await;
                Ok(())
            })
            .await;

        assert_eq!(tracker.status("vm-1").await, Some(ProvisionStatus::InProgress));
        tx.send(()).unwrap();
        assert_eq!(tracker.wait("vm-1").await, Some(ProvisionStatus::Completed));
    }

    #[tokio::test]
    async fn test_unknown_and_forgotten() {
        let tracker = ProvisionTracker::new();
        assert_eq!(tracker.status("nope").await, None);
        assert_eq!(tracker.wait("nope").await, None);

        tracker.spawn("vm-1", std::future::pending::<Result<()>>()).await;
        tracker.forget("vm-1").await;
        assert_eq!(tracker.status("vm-1").await, None);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_all_see_the_outcome() {
        let tracker = ProvisionTracker::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tracker
            .spawn("vm-1", async move {
                let _ = rx.await;
                Ok(())
            })
            .await;

        let first = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait("vm-1").await }
        });
        let second = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait("vm-1").await }
        });

        tokio::task::yield_now().await;
        assert!(!first.is_finished());
        assert!(!second.is_finished());

        tx.send(()).unwrap();
        assert_eq!(first.await.unwrap(), Some(ProvisionStatus::Completed));
        assert_eq!(second.await.unwrap(), Some(ProvisionStatus::Completed));
    }

    #[tokio::test]
    async fn test_forget_aborts_while_someone_waits() {
        let tracker = ProvisionTracker::new();
        let (dropped_tx, dropped_rx) = tokio::sync::oneshot::channel::<()>();

        struct SignalOnDrop(Option<tokio::sync::oneshot::Sender<()>>);
        impl Drop for SignalOnDrop {
            fn drop(&mut self) {
                if let Some(tx) = self.0.take() {
                    let _ = tx.send(());
                }
            }
        }

        let guard = SignalOnDrop(Some(dropped_tx));
        tracker
            .spawn("vm-1", async move {
                let _guard = guard;
                std::future::pending::<Result<()>>().await
            })
            .await;

        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait("vm-1").await }
        });
        tokio::task::yield_now().await;

        tracker.forget("vm-1").await;

        // The aborted task drops its future, releasing the guard
        dropped_rx.await.unwrap();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_panicked_task_reads_as_failed() {
        let tracker = ProvisionTracker::new();
        tracker
            .spawn("vm-1", async {
                if true {
                    panic!("clone exploded");
                }
                Ok(())
            })
            .await;

        assert!(tracker.wait("vm-1").await.unwrap().is_failed());
    }

    #[tokio::test]
    async fn test_source_lock_is_shared_per_source() {
        let tracker = ProvisionTracker::new();
        let a = tracker.source_lock("base").await;
        let b = tracker.source_lock("base").await;
        let c = tracker.source_lock("other").await;

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_released_source_locks_are_pruned() {
        let tracker = ProvisionTracker::new();

        let held = tracker.source_lock("base").await;
        drop(tracker.source_lock("old").await);
        assert_eq!(tracker.source_locks.lock().await.len(), 2);

        let _other = tracker.source_lock("other").await;
        let names: Vec<String> = {
            let mut names: Vec<String> = tracker.source_locks.lock().await.keys().cloned().collect();
            names.sort();
            names
        };
        assert_eq!(names, vec!["base", "other"]);

        // Still shared while held
        assert!(Arc::ptr_eq(&held, &tracker.source_lock("base").await));
    }
}
