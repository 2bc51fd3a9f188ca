use std::sync::Arc;

use tokio::task::JoinHandle;

use super::engine::{SyncContext, run_task};

/// Fixed set of tokio tasks draining the shared queue.
pub struct WorkerPool {
    ctx: Arc<SyncContext>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(ctx: Arc<SyncContext>, workers: usize) -> Self {
        let workers = workers.max(1);
        let handles = (0..workers)
            .map(|worker| {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    tracing::debug!(worker, "worker started");
                    while let Some(task) = ctx.queue.pop_task(None).await {
                        run_task(&ctx, task).await;
                    }
                    tracing::debug!(worker, "worker stopped");
                })
            })
            .collect();
        Self { ctx, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stops the queue and waits for every worker to finish its current task.
    pub async fn shutdown(self) {
        self.ctx.queue.shutdown(self.handles.len());
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "worker ended abnormally");
            }
        }
    }
}
