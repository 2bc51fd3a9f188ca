use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use onedrive_core::{ItemLocator, remote_path};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::cache::ItemKey;
use super::engine::{SyncContext, SyncError};
use super::local;
use super::paths;
use super::task::{DeleteTicket, Task, TaskAction};

const MAX_PENDING_RENAMES: usize = 256;

/// Filesystem change below the sync root, as a drive-relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Changed { path: String },
    Removed { path: String },
    RenamedFrom { path: String, cookie: usize },
    RenamedTo { path: String, cookie: usize },
    Renamed {
        from: String,
        to: String,
        cookie: Option<usize>,
    },
}

pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let watch_root = root.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for local in map_event(&watch_root, event) {
                let _ = tx.send(local);
            }
        }
        Err(err) => tracing::warn!(error = %err, "filesystem watcher error"),
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    let cookie = event.attrs.tracker();
    let paths: Vec<String> = event
        .paths
        .iter()
        .filter_map(|path| to_relative(root, path))
        .collect();
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match (
            event.paths.first().and_then(|path| to_relative(root, path)),
            event.paths.get(1).and_then(|path| to_relative(root, path)),
        ) {
            (Some(from), Some(to)) => vec![LocalEvent::Renamed { from, to, cookie }],
            (None, Some(path)) => vec![LocalEvent::Changed { path }],
            (Some(path), None) => vec![LocalEvent::Removed { path }],
            (None, None) => Vec::new(),
        },
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => paths
            .into_iter()
            .map(|path| match cookie {
                Some(cookie) => LocalEvent::RenamedFrom { path, cookie },
                None => LocalEvent::Removed { path },
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths
            .into_iter()
            .map(|path| match cookie {
                Some(cookie) => LocalEvent::RenamedTo { path, cookie },
                None => LocalEvent::Changed { path },
            })
            .collect(),
        EventKind::Create(_) | EventKind::Modify(_) => paths
            .into_iter()
            .map(|path| LocalEvent::Changed { path })
            .collect(),
        EventKind::Remove(_) => paths
            .into_iter()
            .map(|path| LocalEvent::Removed { path })
            .collect(),
        _ => Vec::new(),
    }
}

/// Drive-relative path of a watched file; temporary download files and
/// the root itself are skipped.
fn to_relative(root: &Path, path: &Path) -> Option<String> {
    let relative = paths::relative_path(root, path).ok()?;
    let (_, name) = paths::split(&relative);
    if name.is_empty() || local::is_partial(&name) {
        return None;
    }
    Some(relative)
}

struct PendingRename {
    from: String,
    ticket: DeleteTicket,
    moved: bool,
}

/// Turns watcher events into sync tasks.
pub struct EventPlanner {
    ctx: Arc<SyncContext>,
    renames: HashMap<usize, PendingRename>,
}

impl EventPlanner {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            renames: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<LocalEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Err(err) = self.handle(event.clone()).await {
                tracing::warn!(?event, error = %err, "failed to plan local change");
            }
        }
        tracing::debug!("local event planner stopped");
    }

    pub async fn handle(&mut self, event: LocalEvent) -> Result<(), SyncError> {
        match event {
            LocalEvent::Changed { path } => self.changed(&path).await,
            LocalEvent::Removed { path } => {
                self.removed(&path, DeleteTicket::new()).await?;
                Ok(())
            }
            LocalEvent::RenamedFrom { path, cookie } => {
                let ticket = DeleteTicket::new();
                self.removed(&path, ticket.clone()).await?;
                if self.renames.len() >= MAX_PENDING_RENAMES {
                    self.renames.retain(|_, pending| !pending.moved);
                }
                self.renames.insert(
                    cookie,
                    PendingRename {
                        from: path,
                        ticket,
                        moved: false,
                    },
                );
                Ok(())
            }
            LocalEvent::RenamedTo { path, cookie } => match self.renames.get_mut(&cookie) {
                Some(pending) if !pending.moved => {
                    pending.moved = true;
                    let from = pending.from.clone();
                    let ticket = pending.ticket.clone();
                    self.moved(from, &path, Some(ticket)).await
                }
                _ => self.changed(&path).await,
            },
            LocalEvent::Renamed { from, to, cookie } => {
                let pending = cookie.and_then(|cookie| self.renames.remove(&cookie));
                match pending {
                    Some(pending) if pending.moved => Ok(()),
                    Some(pending) => self.moved(pending.from, &to, Some(pending.ticket)).await,
                    None => self.moved(from, &to, None).await,
                }
            }
        }
    }

    async fn changed(&self, path: &str) -> Result<(), SyncError> {
        let ctx = &self.ctx;
        let Some(entry) = local::stat(&ctx.local_path(path)?).await? else {
            return Ok(());
        };
        if ctx.drive.filter.should_ignore(path, entry.is_dir) {
            return Ok(());
        }
        let (parent, name) = paths::split(path);
        if entry.is_dir {
            ctx.enqueue(Task::at(&parent, TaskAction::MergeDirectory));
            return Ok(());
        }

        let hashes = local::hash_file(&ctx.local_path(path)?).await?;
        let own_path = remote_path(path);
        let parent_path = remote_path(&parent);
        if let Some(record) = ctx
            .cache
            .get(ItemKey::Path {
                parent_path: &parent_path,
                name: &name,
            })
            .await?
            && record
                .sha1_hash
                .as_deref()
                .is_some_and(|sha1| sha1.eq_ignore_ascii_case(&hashes.sha1))
        {
            tracing::debug!(path, "content matches cached record");
            return Ok(());
        }

        let twin = ctx
            .cache
            .get_by_hash(None, Some(&hashes.sha1))
            .await?
            .into_iter()
            .find(|record| !record.is_folder() && record.path() != own_path);
        let action = match twin {
            Some(record) => {
                tracing::info!(path, source = %record.path(), "content already remote, copying");
                TaskAction::AsyncCopy {
                    source: ItemLocator::Id(record.item_id),
                }
            }
            None => TaskAction::Upload,
        };
        ctx.enqueue(Task::new(parent, name, action));
        Ok(())
    }

    /// Schedules a delayed Delete for a cached path. Returns whether one
    /// was scheduled.
    async fn removed(&self, path: &str, ticket: DeleteTicket) -> Result<bool, SyncError> {
        let ctx = &self.ctx;
        let (parent, name) = paths::split(path);
        let parent_path = remote_path(&parent);
        let Some(record) = ctx
            .cache
            .get(ItemKey::Path {
                parent_path: &parent_path,
                name: &name,
            })
            .await?
        else {
            return Ok(false);
        };
        let task = Task::new(
            parent,
            name,
            TaskAction::Delete {
                is_folder: record.is_folder(),
                ticket: Some(ticket),
            },
        );
        ctx.queue.add_task_after(task, ctx.drive.move_delay);
        tracing::debug!(path, delay = ?ctx.drive.move_delay, "delete scheduled");
        Ok(true)
    }

    async fn moved(&self, from: String, to: &str, ticket: Option<DeleteTicket>) -> Result<(), SyncError> {
        let ctx = &self.ctx;
        let is_dir = local::stat(&ctx.local_path(to)?)
            .await?
            .is_some_and(|entry| entry.is_dir);
        if ctx.drive.filter.should_ignore(to, is_dir) {
            return Ok(());
        }
        if let Some(ticket) = &ticket {
            ticket.mark_handled();
        }
        tracing::info!(from = %from, to, "local rename");
        ctx.enqueue(Task::at(to, TaskAction::Move { from, ticket }));
        Ok(())
    }
}
