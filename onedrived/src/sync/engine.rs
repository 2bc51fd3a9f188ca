use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use onedrive_core::{DriveClient, DriveError, remote_path};
use thiserror::Error;

use super::cache::{CacheError, ItemCache};
use super::paths::{self, PathError};
use super::scheduler::TaskQueue;
use super::task::{Task, TaskAction};
use super::{merge, ops, transfer};
use crate::config::DriveConfig;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("drive error: {0}")]
    Drive(#[from] DriveError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("size mismatch for {path}: expected {expected}, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

/// Everything a task needs to act on one drive.
pub struct SyncContext {
    pub client: DriveClient,
    pub cache: ItemCache,
    pub queue: Arc<TaskQueue>,
    pub drive: DriveConfig,
}

impl SyncContext {
    pub fn new(client: DriveClient, cache: ItemCache, queue: Arc<TaskQueue>, drive: DriveConfig) -> Self {
        Self {
            client,
            cache,
            queue,
            drive,
        }
    }

    pub fn local_path(&self, path: &str) -> Result<PathBuf, SyncError> {
        Ok(paths::local_path(&self.drive.local_root, path)?)
    }

    /// Cache parent path of the items addressed by `task`.
    pub fn remote_parent(task: &Task) -> String {
        remote_path(&task.parent)
    }

    pub fn enqueue(&self, task: Task) -> bool {
        let kind = task.kind();
        let path = task.path();
        let added = self.queue.add_task(task);
        if added {
            tracing::debug!(kind = %kind, path = %path, "task queued");
        }
        added
    }
}

/// Runs one task to completion. Failures are logged and the task is
/// abandoned; the next full pass picks the path up again.
pub async fn run_task(ctx: &SyncContext, task: Task) {
    let id = task.id;
    let kind = task.kind();
    let path = task.path();
    tracing::debug!(task_id = id, kind = %kind, path = %path, "task started");

    let result = execute(ctx, &task).await;
    if task.holds_path() {
        ctx.queue.release_hold(&path, id);
    }
    ctx.queue.task_done();

    match result {
        Ok(()) => tracing::debug!(task_id = id, kind = %kind, path = %path, "task finished"),
        Err(SyncError::Drive(err)) => tracing::error!(
            task_id = id,
            kind = %kind,
            path = %path,
            class = ?err.classification(),
            error = %err,
            "task failed"
        ),
        Err(err) => tracing::error!(task_id = id, kind = %kind, path = %path, error = %err, "task failed"),
    }
}

async fn execute(ctx: &SyncContext, task: &Task) -> Result<(), SyncError> {
    match &task.action {
        TaskAction::MergeDirectory => merge::merge_directory(ctx, task).await,
        TaskAction::Download { item } => transfer::download(ctx, task, item).await,
        TaskAction::Upload => transfer::upload(ctx, task).await,
        TaskAction::Delete { is_folder, ticket } => {
            ops::delete(ctx, task, *is_folder, ticket.as_ref()).await
        }
        TaskAction::Move { from, ticket } => ops::move_item(ctx, task, from, ticket.as_ref()).await,
        TaskAction::AsyncCopy { source } => ops::async_copy(ctx, task, source).await,
        TaskAction::AsyncCopyPoll { session } => ops::poll_copy(ctx, task, session).await,
        TaskAction::UpdateMetadata { modified } => {
            ops::update_metadata(ctx, task, *modified).await
        }
    }
}
