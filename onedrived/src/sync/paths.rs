use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path contains unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("path {0} is outside the sync root")]
    OutsideRoot(String),
}

/// Joins a drive-relative parent (`/`, `/Docs`) and a name. An empty name
/// addresses the parent itself.
pub fn join(parent: &str, name: &str) -> String {
    if name.is_empty() {
        return parent.to_string();
    }
    let parent = parent.trim_end_matches('/');
    format!("{parent}/{name}")
}

/// Splits `/Docs/a.txt` into (`/Docs`, `a.txt`). The root splits into
/// (`/`, ``).
pub fn split(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None if trimmed.is_empty() => ("/".to_string(), String::new()),
        None => ("/".to_string(), trimmed.to_string()),
    }
}

/// True when `path` is `prefix` or lies below it.
pub fn is_within(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Maps a drive-relative path (`/Docs/A.txt`) under the local sync root.
pub fn local_path(root: &Path, path: &str) -> Result<PathBuf, PathError> {
    let mut out = root.to_path_buf();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(path.to_string()));
            }
        }
    }
    Ok(out)
}

/// Inverse of [`local_path`] for paths reported by the filesystem watcher.
pub fn relative_path(root: &Path, local: &Path) -> Result<String, PathError> {
    let rest = local
        .strip_prefix(root)
        .map_err(|_| PathError::OutsideRoot(local.display().to_string()))?;
    let mut out = String::new();
    for component in rest.components() {
        match component {
            Component::Normal(part) => {
                out.push('/');
                out.push_str(&part.to_string_lossy());
            }
            Component::CurDir => continue,
            _ => return Err(PathError::UnsupportedComponent(local.display().to_string())),
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}
