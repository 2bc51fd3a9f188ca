use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::paths;
use super::task::{Task, TaskKind};

#[derive(Default)]
struct Pending {
    tasks: VecDeque<Task>,
    /// Path -> id of the task that owns it (queued or holding).
    registered: HashMap<String, u64>,
}

/// FIFO of sync tasks with at most one active task per path.
///
/// Every queued task is backed by one semaphore permit, so `pop_task`
/// parks workers until there is work or the queue shuts down.
pub struct TaskQueue {
    pending: Mutex<Pending>,
    permits: Semaphore,
    terminated: AtomicBool,
    next_id: AtomicU64,
    running: AtomicUsize,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            permits: Semaphore::new(0),
            terminated: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            running: AtomicUsize::new(0),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `task` unless its path already has an active task.
    pub fn add_task(&self, mut task: Task) -> bool {
        let path = task.path();
        {
            let mut pending = self.pending();
            if pending.registered.contains_key(&path) {
                tracing::debug!(kind = %task.kind(), path = %path, "path busy, task rejected");
                return false;
            }
            if task.id == 0 {
                task.id = self.next_id.fetch_add(1, Ordering::Relaxed);
            }
            pending.registered.insert(path, task.id);
            pending.tasks.push_back(task);
        }
        self.permits.add_permits(1);
        true
    }

    /// Re-queues `task` after `delay` on a timer instead of a worker.
    pub fn add_task_after(self: &Arc<Self>, task: Task, delay: Duration) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if queue.is_terminated() {
                return;
            }
            let kind = task.kind();
            let path = task.path();
            if !queue.add_task(task) {
                tracing::debug!(kind = %kind, path = %path, "delayed task dropped, path busy");
            }
        })
    }

    pub fn has_pending_task(&self, path: &str) -> bool {
        self.pending().registered.contains_key(path)
    }

    /// Waits for a task. With `kind`, only the first task of that kind is
    /// taken. Returns `None` after shutdown or when nothing matches.
    pub async fn pop_task(&self, kind: Option<TaskKind>) -> Option<Task> {
        if self.is_terminated() {
            return None;
        }
        let permit = self.permits.acquire().await.ok()?;
        if self.is_terminated() {
            permit.forget();
            return None;
        }
        let mut pending = self.pending();
        let index = match kind {
            None => (!pending.tasks.is_empty()).then_some(0),
            Some(kind) => pending.tasks.iter().position(|task| task.kind() == kind),
        };
        let Some(task) = index.and_then(|index| pending.tasks.remove(index)) else {
            if pending.tasks.is_empty() {
                // The permit belonged to a task removed by remove_children_tasks.
                permit.forget();
            }
            return None;
        };
        permit.forget();
        self.running.fetch_add(1, Ordering::SeqCst);
        if !task.holds_path() {
            let path = task.path();
            if pending.registered.get(&path) == Some(&task.id) {
                pending.registered.remove(&path);
            }
        }
        Some(task)
    }

    /// Marks a popped task as finished. Call once per task returned by
    /// [`pop_task`](Self::pop_task).
    pub fn task_done(&self) {
        let _ = self
            .running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Nothing queued, nothing running and no path held.
    pub fn is_idle(&self) -> bool {
        let pending = self.pending();
        pending.tasks.is_empty() && pending.registered.is_empty() && self.running() == 0
    }

    /// Releases `path` if it is still held by task `task_id`.
    pub fn release_hold(&self, path: &str, task_id: u64) -> bool {
        let mut pending = self.pending();
        if pending.registered.get(path) == Some(&task_id) {
            pending.registered.remove(path);
            true
        } else {
            false
        }
    }

    /// Drops queued tasks strictly below `prefix`. Returns how many.
    pub fn remove_children_tasks(&self, prefix: &str) -> usize {
        let removed = {
            let mut pending = self.pending();
            let mut kept = VecDeque::with_capacity(pending.tasks.len());
            let mut removed = Vec::new();
            for task in pending.tasks.drain(..) {
                let path = task.path();
                if path != prefix && paths::is_within(&path, prefix) {
                    removed.push((path, task.id));
                } else {
                    kept.push_back(task);
                }
            }
            pending.tasks = kept;
            for (path, id) in &removed {
                if pending.registered.get(path) == Some(id) {
                    pending.registered.remove(path);
                }
            }
            removed.len()
        };
        for _ in 0..removed {
            match self.permits.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => break,
            }
        }
        if removed > 0 {
            tracing::debug!(prefix, removed, "dropped queued descendant tasks");
        }
        removed
    }

    /// Stops handing out tasks and wakes `workers` parked callers.
    pub fn shutdown(&self, workers: usize) {
        self.terminated.store(true, Ordering::SeqCst);
        self.permits.add_permits(workers);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.pending().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().tasks.is_empty()
    }

    /// Number of paths registered by queued or holding tasks.
    pub fn active_paths(&self) -> usize {
        self.pending().registered.len()
    }

    pub fn queued_snapshot(&self) -> Vec<(TaskKind, String)> {
        self.pending()
            .tasks
            .iter()
            .map(|task| (task.kind(), task.path()))
            .collect()
    }
}
