use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use onedrive_core::{AsyncCopySession, DriveItem, ItemLocator};
use time::OffsetDateTime;

use super::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    MergeDirectory,
    Download,
    Upload,
    Delete,
    Move,
    AsyncCopy,
    AsyncCopyPoll,
    UpdateMetadata,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::MergeDirectory => "merge_directory",
            TaskKind::Download => "download",
            TaskKind::Upload => "upload",
            TaskKind::Delete => "delete",
            TaskKind::Move => "move",
            TaskKind::AsyncCopy => "async_copy",
            TaskKind::AsyncCopyPoll => "async_copy_poll",
            TaskKind::UpdateMetadata => "update_metadata",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared flag between a delayed Delete and a Move of the same source.
/// Once handled, the Delete is dropped.
#[derive(Debug, Clone, Default)]
pub struct DeleteTicket(Arc<AtomicBool>);

impl DeleteTicket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_handled(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_handled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub enum TaskAction {
    MergeDirectory,
    Download {
        item: Box<DriveItem>,
    },
    Upload,
    Delete {
        is_folder: bool,
        ticket: Option<DeleteTicket>,
    },
    /// Moves `from` (drive-relative) to the task's own path.
    Move {
        from: String,
        ticket: Option<DeleteTicket>,
    },
    AsyncCopy {
        source: ItemLocator,
    },
    AsyncCopyPoll {
        session: AsyncCopySession,
    },
    UpdateMetadata {
        modified: OffsetDateTime,
    },
}

/// Unit of work bound to one drive-relative path (`parent` + `name`).
///
/// `id` is zero until the task is first queued.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: u64,
    pub parent: String,
    pub name: String,
    pub action: TaskAction,
}

impl Task {
    pub fn new(parent: impl Into<String>, name: impl Into<String>, action: TaskAction) -> Self {
        Self {
            id: 0,
            parent: parent.into(),
            name: name.into(),
            action,
        }
    }

    pub fn at(path: &str, action: TaskAction) -> Self {
        let (parent, name) = paths::split(path);
        Self::new(parent, name, action)
    }

    pub fn merge_root() -> Self {
        Self::new("/", "", TaskAction::MergeDirectory)
    }

    pub fn path(&self) -> String {
        paths::join(&self.parent, &self.name)
    }

    pub fn kind(&self) -> TaskKind {
        match self.action {
            TaskAction::MergeDirectory => TaskKind::MergeDirectory,
            TaskAction::Download { .. } => TaskKind::Download,
            TaskAction::Upload => TaskKind::Upload,
            TaskAction::Delete { .. } => TaskKind::Delete,
            TaskAction::Move { .. } => TaskKind::Move,
            TaskAction::AsyncCopy { .. } => TaskKind::AsyncCopy,
            TaskAction::AsyncCopyPoll { .. } => TaskKind::AsyncCopyPoll,
            TaskAction::UpdateMetadata { .. } => TaskKind::UpdateMetadata,
        }
    }

    /// Tasks that keep their path registered while they run. A download
    /// holds until its record is written, so the watcher cannot mistake
    /// the renamed partial file for a local edit.
    pub fn holds_path(&self) -> bool {
        matches!(
            self.action,
            TaskAction::Upload | TaskAction::Download { .. }
        )
    }
}
