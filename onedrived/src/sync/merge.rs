//! Directory reconciliation.
//!
//! A merge compares three views of one directory: the local listing, the
//! remote children and the cached record of each remote item. Every entry
//! turns into at most one follow-up task; subdirectories get their own
//! merge task instead of being walked recursively.

use std::collections::BTreeMap;
use std::path::Path;

use onedrive_core::{ConflictBehavior, DriveItem, ItemLocator, remote_path};

use super::cache::{ItemKey, ItemRecord, ItemStatus};
use super::engine::{SyncContext, SyncError};
use super::local::{self, LocalEntry, same_mtime};
use super::paths;
use super::task::{Task, TaskAction};

/// One directory being merged: `rel` is its drive-relative path, `dir` its
/// local location and `remote_parent` the cache parent path of its children.
struct Scope<'a> {
    ctx: &'a SyncContext,
    rel: String,
    dir: &'a Path,
    remote_parent: String,
}

impl Scope<'_> {
    fn child(&self, name: &str) -> String {
        paths::join(&self.rel, name)
    }

    async fn record(&self, name: &str) -> Result<Option<ItemRecord>, SyncError> {
        Ok(self
            .ctx
            .cache
            .get(ItemKey::Path {
                parent_path: &self.remote_parent,
                name,
            })
            .await?)
    }

    async fn drop_record(&self, record: &ItemRecord) -> Result<(), SyncError> {
        self.ctx
            .cache
            .delete(ItemKey::Id(&record.item_id), record.is_folder())
            .await?;
        Ok(())
    }

    async fn remember(&self, item: &DriveItem) -> Result<(), SyncError> {
        self.ctx
            .cache
            .upsert(item, &self.remote_parent, ItemStatus::Ok)
            .await?;
        Ok(())
    }

    fn enqueue(&self, name: &str, action: TaskAction) {
        self.ctx
            .enqueue(Task::new(self.rel.clone(), name.to_string(), action));
    }
}

pub async fn merge_directory(ctx: &SyncContext, task: &Task) -> Result<(), SyncError> {
    let rel = task.path();
    let dir = ctx.local_path(&rel)?;
    match local::stat(&dir).await? {
        Some(entry) if entry.is_dir => {}
        _ => {
            tracing::warn!(path = %rel, "merge target is not a local directory");
            return Ok(());
        }
    }

    let scope = Scope {
        ctx,
        remote_parent: remote_path(&rel),
        rel,
        dir: &dir,
    };
    let mut untouched: BTreeMap<String, LocalEntry> =
        local::list_entries(&dir, &scope.rel, &ctx.drive.filter)
            .await?
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();

    let mut page = ctx.client.list_children(&scope.rel).await?;
    loop {
        for item in page.value {
            let local = untouched.remove(&item.name);
            let child = scope.child(&item.name);
            if ctx.drive.filter.should_ignore(&child, item.is_folder())
                || ctx.queue.has_pending_task(&child)
            {
                continue;
            }
            if let Err(err) = merge_remote_item(&scope, item, local, &mut untouched).await {
                tracing::warn!(path = %child, error = %err, "failed to merge remote entry");
            }
        }
        match page.next_link {
            Some(link) => page = ctx.client.list_children_next(&link).await?,
            None => break,
        }
    }

    for (name, entry) in untouched {
        let child = scope.child(&name);
        if ctx.queue.has_pending_task(&child) {
            continue;
        }
        if let Err(err) = merge_local_item(&scope, &name, &entry).await {
            tracing::warn!(path = %child, error = %err, "failed to merge local entry");
        }
    }
    Ok(())
}

async fn merge_remote_item(
    scope: &Scope<'_>,
    item: DriveItem,
    local: Option<LocalEntry>,
    untouched: &mut BTreeMap<String, LocalEntry>,
) -> Result<(), SyncError> {
    let record = scope.record(&item.name).await?;
    let Some(entry) = local else {
        return match record {
            Some(record) if record.same_version_as(&item) => {
                tracing::info!(path = %scope.child(&item.name), "deleted locally, removing remote copy");
                scope.enqueue(
                    &item.name,
                    TaskAction::Delete {
                        is_folder: item.is_folder(),
                        ticket: None,
                    },
                );
                Ok(())
            }
            _ => fetch_remote(scope, item).await,
        };
    };

    if entry.is_dir != item.is_folder() {
        tracing::info!(path = %scope.child(&item.name), "type conflict, keeping both");
        return keep_both(scope, item, record, untouched).await;
    }

    let stale = record
        .as_ref()
        .is_none_or(|record| !record.same_version_as(&item));
    if entry.is_dir {
        if stale {
            scope.remember(&item).await?;
        }
        scope.enqueue(&item.name, TaskAction::MergeDirectory);
        return Ok(());
    }
    merge_file(scope, item, entry, record, stale, untouched).await
}

async fn merge_file(
    scope: &Scope<'_>,
    item: DriveItem,
    entry: LocalEntry,
    record: Option<ItemRecord>,
    stale: bool,
    untouched: &mut BTreeMap<String, LocalEntry>,
) -> Result<(), SyncError> {
    let remote_mtime = item.client_modified_time();
    if !scope.ctx.drive.strict_hash_check
        && entry.size == item.size
        && same_mtime(entry.modified, remote_mtime)
    {
        if stale {
            scope.remember(&item).await?;
        }
        return Ok(());
    }

    if let Some(remote_hashes) = item.hashes().filter(|hashes| !hashes.is_empty()) {
        let local_hashes = local::hash_file(&scope.dir.join(&item.name)).await?;
        if local_hashes.matches(remote_hashes) == Some(true) {
            if stale {
                scope.remember(&item).await?;
            }
            if !same_mtime(entry.modified, remote_mtime)
                && let Some(modified) = entry.modified
            {
                scope.enqueue(&item.name, TaskAction::UpdateMetadata { modified });
            }
            return Ok(());
        }
    }

    let path = scope.child(&item.name);
    let remote_unchanged = record
        .as_ref()
        .is_some_and(|record| record.same_version_as(&item));
    let local_unchanged = record.as_ref().is_some_and(|record| {
        entry.size == record.size && same_mtime(entry.modified, record.modified_time)
    });
    if remote_unchanged {
        tracing::info!(path = %path, "changed locally, uploading");
        scope.enqueue(&item.name, TaskAction::Upload);
        Ok(())
    } else if local_unchanged {
        tracing::info!(path = %path, "changed remotely, downloading");
        let name = item.name.clone();
        scope.enqueue(
            &name,
            TaskAction::Download {
                item: Box::new(item),
            },
        );
        Ok(())
    } else {
        tracing::info!(path = %path, "both copies changed, keeping both");
        keep_both(scope, item, record, untouched).await
    }
}

/// Moves the local entry aside, queues it for upload under its new name
/// and fetches the remote item into the original place.
async fn keep_both(
    scope: &Scope<'_>,
    item: DriveItem,
    record: Option<ItemRecord>,
    untouched: &mut BTreeMap<String, LocalEntry>,
) -> Result<(), SyncError> {
    let renamed =
        local::rename_keep_both(scope.dir, &item.name, &scope.ctx.drive.host_label).await?;
    if let Some(entry) = local::stat(&scope.dir.join(&renamed)).await? {
        untouched.insert(renamed.clone(), LocalEntry { name: renamed, ..entry });
    }
    if let Some(record) = record {
        scope.drop_record(&record).await?;
    }
    fetch_remote(scope, item).await
}

/// Brings a remote item that has no local counterpart to this side.
async fn fetch_remote(scope: &Scope<'_>, item: DriveItem) -> Result<(), SyncError> {
    if !item.is_folder() {
        let name = item.name.clone();
        scope.enqueue(
            &name,
            TaskAction::Download {
                item: Box::new(item),
            },
        );
        return Ok(());
    }
    tokio::fs::create_dir_all(scope.dir.join(&item.name)).await?;
    scope.remember(&item).await?;
    scope.enqueue(&item.name, TaskAction::MergeDirectory);
    Ok(())
}

async fn merge_local_item(scope: &Scope<'_>, name: &str, entry: &LocalEntry) -> Result<(), SyncError> {
    let record = scope.record(name).await?;
    let path = scope.child(name);
    if let Some(record) = &record
        && record.is_folder() == entry.is_dir
    {
        tracing::info!(path = %path, trash = scope.ctx.drive.trash_removed, "deleted remotely, removing local copy");
        local::remove(&scope.dir.join(name), scope.ctx.drive.trash_removed).await?;
        scope.drop_record(record).await?;
        return Ok(());
    }

    if let Some(record) = &record {
        scope.drop_record(record).await?;
    }
    if !entry.is_dir {
        scope.enqueue(name, TaskAction::Upload);
        return Ok(());
    }

    let folder = match scope
        .ctx
        .client
        .create_folder(&scope.rel, name, ConflictBehavior::Fail)
        .await
    {
        Ok(folder) => folder,
        Err(err) if err.is_name_conflict() => {
            scope
                .ctx
                .client
                .get_item(&ItemLocator::Path(path.clone()))
                .await?
        }
        Err(err) => return Err(err.into()),
    };
    tracing::info!(path = %path, "created remote folder");
    scope.remember(&folder).await?;
    scope.enqueue(name, TaskAction::MergeDirectory);
    Ok(())
}

#[cfg(test)]
#[path = "merge_tests.rs"]
mod tests;
