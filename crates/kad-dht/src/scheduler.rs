//! Timer wheel for periodic maintenance and one-shot delayed work.
//!
//! RPC timeouts are handled inline by [`crate::rpc::RpcLayer`] via
//! `tokio::time::timeout`, the idiomatic per-call primitive; this scheduler
//! is the sole authority for the node's own periodic sweeps (DataStore
//! expiry, bucket refresh, republish) and any other delayed callback the
//! node schedules against itself.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Identifies a scheduled task for cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

/// Drives periodic and one-shot delayed tasks on tokio's own timer.
///
/// Cancellation is cooperative: a cancelled task's closure simply never
/// runs again, checked just before each tick fires.
pub struct Scheduler {
    next_id: AtomicU64,
    cancelled: Arc<Mutex<HashSet<TaskId>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            cancelled: Arc::new(Mutex::new(HashSet::new())),
            handles: Mutex::new(Vec::new()),
        }
    }

    fn allocate_id(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Run `task` once, after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, task: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.allocate_id();
        let cancelled = self.cancelled.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !cancelled.lock().expect("scheduler cancelled-set mutex poisoned").contains(&id) {
                task();
            }
        });
        self.handles.lock().expect("scheduler handles mutex poisoned").push(handle);
        id
    }

    /// Run `task` every `period`, starting after the first `period` elapses,
    /// until cancelled.
    pub fn schedule_periodic<F>(&self, period: Duration, mut task: F) -> TaskId
    where
        F: FnMut() + Send + 'static,
    {
        let id = self.allocate_id();
        let cancelled = self.cancelled.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately; consume it
            loop {
                interval.tick().await;
                if cancelled.lock().expect("scheduler cancelled-set mutex poisoned").contains(&id) {
                    break;
                }
                task();
            }
        });
        self.handles.lock().expect("scheduler handles mutex poisoned").push(handle);
        id
    }

    /// Cancel a scheduled task. A one-shot task not yet fired will be
    /// skipped; a periodic task will stop after its current tick.
    pub fn cancel(&self, id: TaskId) {
        self.cancelled.lock().expect("scheduler cancelled-set mutex poisoned").insert(id);
    }

    /// Abort every task this scheduler owns, for shutdown.
    pub fn shutdown(&self) {
        let mut handles = self.handles.lock().expect("scheduler handles mutex poisoned");
        for handle in handles.drain(..) {
            handle.abort();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
