use onedrive_core::{
    AsyncCopySession, AsyncOperationStatus, ItemLocator, ItemPatch, ItemReference, remote_path,
};
use time::OffsetDateTime;

use super::cache::{ItemKey, ItemStatus};
use super::engine::{SyncContext, SyncError};
use super::local;
use super::paths;
use super::task::{DeleteTicket, Task, TaskAction};

pub async fn delete(
    ctx: &SyncContext,
    task: &Task,
    is_folder: bool,
    ticket: Option<&DeleteTicket>,
) -> Result<(), SyncError> {
    let path = task.path();
    if ticket.is_some_and(DeleteTicket::is_handled) {
        tracing::debug!(path = %path, "delete superseded by a move");
        return Ok(());
    }

    match ctx.client.delete_item(&ItemLocator::Path(path.clone())).await {
        Ok(()) => tracing::info!(path = %path, "deleted remote item"),
        Err(err) if err.is_not_found() => {
            tracing::debug!(path = %path, "remote item already gone")
        }
        Err(err) => return Err(err.into()),
    }

    let parent_path = SyncContext::remote_parent(task);
    ctx.cache
        .delete(
            ItemKey::Path {
                parent_path: &parent_path,
                name: &task.name,
            },
            is_folder,
        )
        .await?;
    if is_folder {
        ctx.queue.remove_children_tasks(&path);
    }
    Ok(())
}

/// Renames or reparents the remote item at `from` to the task's path.
pub async fn move_item(
    ctx: &SyncContext,
    task: &Task,
    from: &str,
    ticket: Option<&DeleteTicket>,
) -> Result<(), SyncError> {
    if let Some(ticket) = ticket {
        ticket.mark_handled();
    }
    let to = task.path();
    let (from_parent, from_name) = paths::split(from);

    let mut patch = ItemPatch {
        name: Some(task.name.clone()),
        ..ItemPatch::default()
    };
    if from_parent != task.parent {
        patch.parent_reference = Some(ItemReference {
            path: Some(remote_path(&task.parent)),
            ..ItemReference::default()
        });
    }

    let item = match ctx
        .client
        .update_item(&ItemLocator::Path(from.to_string()), &patch)
        .await
    {
        Ok(item) => item,
        Err(err) if err.is_not_found() => {
            tracing::info!(from, to = %to, "move source missing remotely, syncing target instead");
            let target = ctx.local_path(&to)?;
            let follow_up = match local::stat(&target).await? {
                Some(entry) if entry.is_dir => Task::at(&to, TaskAction::MergeDirectory),
                Some(_) => Task::at(&to, TaskAction::Upload),
                None => return Ok(()),
            };
            ctx.enqueue(follow_up);
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    ctx.cache
        .move_subtree(&remote_path(from), &remote_path(&to))
        .await?;
    ctx.cache
        .delete(
            ItemKey::Path {
                parent_path: &remote_path(&from_parent),
                name: &from_name,
            },
            false,
        )
        .await?;
    ctx.cache
        .upsert(&item, &SyncContext::remote_parent(task), ItemStatus::Ok)
        .await?;
    tracing::info!(from, to = %to, "moved remote item");
    Ok(())
}

pub async fn async_copy(
    ctx: &SyncContext,
    task: &Task,
    source: &ItemLocator,
) -> Result<(), SyncError> {
    let session = ctx
        .client
        .copy_item(source, &task.parent, &task.name)
        .await?;
    tracing::info!(path = %task.path(), monitor = %session.monitor_url, "remote copy started");
    schedule_poll(ctx, task, session);
    Ok(())
}

pub async fn poll_copy(
    ctx: &SyncContext,
    task: &Task,
    session: &AsyncCopySession,
) -> Result<(), SyncError> {
    let path = task.path();
    let session = ctx.client.poll_copy(session).await?;
    match session.status {
        AsyncOperationStatus::Failed => {
            tracing::warn!(path = %path, "remote copy failed, uploading instead");
            let target = ctx.local_path(&path)?;
            if local::stat(&target).await?.is_some_and(|entry| !entry.is_dir) {
                ctx.enqueue(Task::new(
                    task.parent.clone(),
                    task.name.clone(),
                    TaskAction::Upload,
                ));
            }
            Ok(())
        }
        AsyncOperationStatus::Completed => {
            let item = match (session.item, session.resource_id) {
                (Some(item), _) => *item,
                (None, Some(id)) => ctx.client.get_item(&ItemLocator::Id(id)).await?,
                (None, None) => {
                    tracing::warn!(path = %path, "remote copy finished without a resulting item");
                    return Ok(());
                }
            };
            ctx.cache
                .upsert(&item, &SyncContext::remote_parent(task), ItemStatus::Ok)
                .await?;
            tracing::info!(path = %path, "remote copy completed");
            Ok(())
        }
        _ => {
            tracing::debug!(path = %path, percent = session.percentage_complete, "remote copy in progress");
            schedule_poll(ctx, task, session);
            Ok(())
        }
    }
}

fn schedule_poll(ctx: &SyncContext, task: &Task, session: AsyncCopySession) {
    let poll = Task::new(
        task.parent.clone(),
        task.name.clone(),
        TaskAction::AsyncCopyPoll { session },
    );
    ctx.queue.add_task_after(poll, ctx.drive.copy_poll_interval);
}

pub async fn update_metadata(
    ctx: &SyncContext,
    task: &Task,
    modified: OffsetDateTime,
) -> Result<(), SyncError> {
    let item = ctx
        .client
        .update_item(
            &ItemLocator::Path(task.path()),
            &ItemPatch::modified_at(modified),
        )
        .await?;
    ctx.cache
        .upsert(&item, &SyncContext::remote_parent(task), ItemStatus::Ok)
        .await?;
    tracing::info!(path = %task.path(), "updated remote mtime");
    Ok(())
}
