use std::io;
use std::path::Path;
use std::time::SystemTime;

use onedrive_core::Hashes;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;

use super::conflict::{CaseFolder, keep_both_name};
use super::filter::PathFilter;
use super::paths;

const PARTIAL_SUFFIX: &str = ".!od";
const HASH_BUFFER: usize = 64 * 1024;

/// Hidden sibling a download is written to before it replaces the target.
pub fn partial_name(name: &str) -> String {
    format!(".{name}{PARTIAL_SUFFIX}")
}

pub fn is_partial(name: &str) -> bool {
    name.ends_with(PARTIAL_SUFFIX)
}

/// Timestamps are compared at the one-second precision the remote keeps.
pub fn same_mtime(left: Option<OffsetDateTime>, right: Option<OffsetDateTime>) -> bool {
    match (left, right) {
        (Some(left), Some(right)) => left.unix_timestamp() == right.unix_timestamp(),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<OffsetDateTime>,
}

impl LocalEntry {
    fn from_metadata(name: String, meta: &std::fs::Metadata) -> Self {
        Self {
            name,
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified: meta.modified().ok().map(OffsetDateTime::from),
        }
    }
}

/// Stats `path`; `None` when nothing exists there.
pub async fn stat(path: &Path) -> io::Result<Option<LocalEntry>> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(LocalEntry::from_metadata(name, &meta))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Lists the entries of `dir` (drive-relative `rel_dir`) in name order.
///
/// Ignored entries and partial downloads are skipped. An entry whose
/// case-folded name repeats an earlier one is renamed on disk first.
pub async fn list_entries(
    dir: &Path,
    rel_dir: &str,
    filter: &PathFilter,
) -> io::Result<Vec<LocalEntry>> {
    let mut names = Vec::new();
    let mut reader = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    let mut folder = CaseFolder::with_existing(names.iter().map(String::as_str));
    let mut entries = Vec::with_capacity(names.len());
    for name in names {
        if is_partial(&name) {
            continue;
        }
        let meta = match tokio::fs::metadata(dir.join(&name)).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        if filter.should_ignore(&paths::join(rel_dir, &name), meta.is_dir()) {
            continue;
        }
        let name = match folder.admit(&name) {
            None => name,
            Some(renamed) => {
                match tokio::fs::rename(dir.join(&name), dir.join(&renamed)).await {
                    Ok(()) => {
                        tracing::info!(dir = %dir.display(), from = %name, to = %renamed, "renamed case conflict");
                        renamed
                    }
                    Err(err) => {
                        tracing::error!(dir = %dir.display(), name = %name, error = %err, "failed to resolve case conflict");
                        continue;
                    }
                }
            }
        };
        entries.push(LocalEntry::from_metadata(name, &meta));
    }
    Ok(entries)
}

/// Moves `dir/name` aside under a host-suffixed name and returns the new name.
pub async fn rename_keep_both(dir: &Path, name: &str, host: &str) -> io::Result<String> {
    let renamed = keep_both_name(name, host, |candidate| dir.join(candidate).exists());
    tokio::fs::rename(dir.join(name), dir.join(&renamed)).await?;
    tracing::info!(dir = %dir.display(), from = %name, to = %renamed, "kept both copies");
    Ok(renamed)
}

pub async fn set_modified(path: &Path, modified: OffsetDateTime) -> io::Result<()> {
    let path = path.to_path_buf();
    let modified = SystemTime::from(modified);
    tokio::task::spawn_blocking(move || std::fs::File::open(&path)?.set_modified(modified))
        .await
        .map_err(io::Error::other)?
}

/// Removes `path`, to the desktop trash when `to_trash` is set.
pub async fn remove(path: &Path, to_trash: bool) -> io::Result<()> {
    if to_trash {
        let path = path.to_path_buf();
        return tokio::task::spawn_blocking(move || trash::delete(&path).map_err(io::Error::other))
            .await
            .map_err(io::Error::other)?;
    }
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

/// Digests of local content in the upper-case hex form the remote reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHashes {
    pub crc32: String,
    pub sha1: String,
    pub sha256: String,
}

impl ContentHashes {
    /// Compares against the strongest digest the remote carries. `None`
    /// when the remote has no digest at all.
    pub fn matches(&self, remote: &Hashes) -> Option<bool> {
        let pairs = [
            (remote.sha1_hash.as_deref(), &self.sha1),
            (remote.sha256_hash.as_deref(), &self.sha256),
            (remote.crc32_hash.as_deref(), &self.crc32),
        ];
        pairs
            .into_iter()
            .find_map(|(theirs, ours)| theirs.map(|theirs| theirs.eq_ignore_ascii_case(ours)))
    }
}

pub async fn hash_file(path: &Path) -> io::Result<ContentHashes> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut crc32 = crc32fast::Hasher::new();
    let mut sha1 = Sha1::new();
    let mut sha256 = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        crc32.update(&buffer[..read]);
        sha1.update(&buffer[..read]);
        sha256.update(&buffer[..read]);
    }
    Ok(ContentHashes {
        crc32: hex::encode_upper(crc32.finalize().to_le_bytes()),
        sha1: hex::encode_upper(sha1.finalize()),
        sha256: hex::encode_upper(sha256.finalize()),
    })
}
