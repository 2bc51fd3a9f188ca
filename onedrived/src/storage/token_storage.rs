use std::io;
use std::path::{Path, PathBuf};

use onedrive_core::OAuthState;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("token file I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("token file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("token not found")]
    TokenNotFound,
}

/// OAuth state persisted as JSON in a single owner-only file.
pub struct TokenStorage {
    path: PathBuf,
}

impl TokenStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get_oauth_state(&self) -> Result<OAuthState, StorageError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::TokenNotFound);
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Writes through a sibling temp file so a crash never leaves a torn file.
    pub async fn save_oauth_state(&self, state: &OAuthState) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        write_private(&tmp, &raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn delete_token(&self) -> Result<(), StorageError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn has_token(&self) -> bool {
        self.get_oauth_state().await.is_ok()
    }
}

/// Creates `path` afresh, owner-only from the first byte on unix.
async fn write_private(path: &Path, raw: &[u8]) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    file.write_all(raw).await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state() -> OAuthState {
        OAuthState {
            refresh_token: Some("refresh".into()),
            expires_at: Some(1_700_000_000),
            ..OAuthState::from_access_token("access")
        }
    }

    #[tokio::test]
    async fn saves_and_loads_state() {
        let dir = tempdir().unwrap();
        let storage = TokenStorage::new(dir.path().join("nested/token.json"));

        storage.save_oauth_state(&sample_state()).await.unwrap();

        assert!(storage.has_token().await);
        assert_eq!(storage.get_oauth_state().await.unwrap(), sample_state());
        assert!(!dir.path().join("nested/token.json.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let storage = TokenStorage::new(dir.path().join("token.json"));

        storage.save_oauth_state(&sample_state()).await.unwrap();

        let mode = std::fs::metadata(storage.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stale_temp_file_does_not_leak_its_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let storage = TokenStorage::new(dir.path().join("token.json"));
        let tmp = dir.path().join("token.json.tmp");
        std::fs::write(&tmp, b"stale").unwrap();
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).unwrap();

        storage.save_oauth_state(&sample_state()).await.unwrap();

        let mode = std::fs::metadata(storage.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(storage.get_oauth_state().await.unwrap(), sample_state());
    }

    #[tokio::test]
    async fn missing_file_reports_not_found() {
        let dir = tempdir().unwrap();
        let storage = TokenStorage::new(dir.path().join("token.json"));

        assert!(matches!(
            storage.get_oauth_state().await,
            Err(StorageError::TokenNotFound)
        ));
        storage.delete_token().await.unwrap();
    }

    #[tokio::test]
    async fn delete_removes_saved_state() {
        let dir = tempdir().unwrap();
        let storage = TokenStorage::new(dir.path().join("token.json"));
        storage.save_oauth_state(&sample_state()).await.unwrap();

        storage.delete_token().await.unwrap();

        assert!(!storage.has_token().await);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, b"not json").unwrap();

        let err = TokenStorage::new(path).get_oauth_state().await.unwrap_err();
        assert!(matches!(err, StorageError::Json(_)));
    }
}
