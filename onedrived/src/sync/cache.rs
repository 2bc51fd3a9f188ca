use std::path::Path;

use onedrive_core::{DriveItem, format_timestamp, parse_timestamp};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::RwLock;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const COLUMNS: &str = "item_id, item_type, item_name, parent_id, parent_path, etag, ctag, size, \
     created_time, modified_time, status, crc32_hash, sha1_hash, sha256_hash";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid item type: {0}")]
    InvalidItemType(String),
    #[error("invalid item status: {0}")]
    InvalidStatus(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    File,
    Folder,
}

impl ItemType {
    fn as_str(&self) -> &'static str {
        match self {
            ItemType::File => "file",
            ItemType::Folder => "folder",
        }
    }

    fn parse(value: &str) -> Result<Self, CacheError> {
        match value {
            "file" => Ok(ItemType::File),
            "folder" => Ok(ItemType::Folder),
            other => Err(CacheError::InvalidItemType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Ok,
    Moving,
    Downloaded,
    Uploaded,
}

impl ItemStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Ok => "ok",
            ItemStatus::Moving => "moving",
            ItemStatus::Downloaded => "downloaded",
            ItemStatus::Uploaded => "uploaded",
        }
    }

    fn parse(value: &str) -> Result<Self, CacheError> {
        match value {
            "ok" => Ok(ItemStatus::Ok),
            "moving" => Ok(ItemStatus::Moving),
            "downloaded" => Ok(ItemStatus::Downloaded),
            "uploaded" => Ok(ItemStatus::Uploaded),
            other => Err(CacheError::InvalidStatus(other.to_string())),
        }
    }
}

/// Last-known snapshot of a remote item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRecord {
    pub item_id: String,
    pub item_type: ItemType,
    pub name: String,
    pub parent_id: Option<String>,
    pub parent_path: Option<String>,
    pub etag: Option<String>,
    pub ctag: Option<String>,
    pub size: u64,
    pub created_time: Option<OffsetDateTime>,
    pub modified_time: Option<OffsetDateTime>,
    pub status: ItemStatus,
    pub crc32_hash: Option<String>,
    pub sha1_hash: Option<String>,
    pub sha256_hash: Option<String>,
}

impl ItemRecord {
    pub fn from_item(item: &DriveItem, parent_path: &str, status: ItemStatus) -> Self {
        let hashes = item.hashes();
        Self {
            item_id: item.id.clone(),
            item_type: if item.is_folder() {
                ItemType::Folder
            } else {
                ItemType::File
            },
            name: item.name.clone(),
            parent_id: item.parent_reference.as_ref().and_then(|r| r.id.clone()),
            parent_path: Some(parent_path.to_string()),
            etag: item.e_tag.clone(),
            ctag: item.c_tag.clone(),
            size: item.size,
            created_time: item.created_time(),
            modified_time: item.client_modified_time(),
            status,
            crc32_hash: hashes.and_then(|h| h.crc32_hash.clone()),
            sha1_hash: hashes.and_then(|h| h.sha1_hash.clone()),
            sha256_hash: hashes.and_then(|h| h.sha256_hash.clone()),
        }
    }

    /// Remote path of the item itself (`/drive/root:/Docs/a.txt`).
    pub fn path(&self) -> String {
        match self.parent_path.as_deref() {
            Some(parent) => format!("{}/{}", parent.trim_end_matches('/'), self.name),
            None => self.name.clone(),
        }
    }

    pub fn is_folder(&self) -> bool {
        self.item_type == ItemType::Folder
    }

    /// True when the remote item has not changed since this record was taken.
    pub fn same_version_as(&self, item: &DriveItem) -> bool {
        self.item_id == item.id && self.etag == item.e_tag && self.ctag == item.c_tag
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ItemKey<'a> {
    Id(&'a str),
    Path { parent_path: &'a str, name: &'a str },
}

/// Durable cache of remote item metadata for one drive.
///
/// Reads share a lock and writes hold it exclusively, so a writer never
/// interleaves with the read-decide-write sequence of another caller.
pub struct ItemCache {
    pool: SqlitePool,
    lock: RwLock<()>,
}

impl ItemCache {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            lock: RwLock::new(()),
        }
    }

    pub async fn open(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await?;
        let cache = Self::from_pool(pool);
        cache.init().await?;
        Ok(cache)
    }

    pub async fn init(&self) -> Result<(), CacheError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get(&self, key: ItemKey<'_>) -> Result<Option<ItemRecord>, CacheError> {
        let _guard = self.lock.read().await;
        let row = match key {
            ItemKey::Id(item_id) => {
                sqlx::query(&format!("SELECT {COLUMNS} FROM items WHERE item_id = ?1"))
                    .bind(item_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            ItemKey::Path { parent_path, name } => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM items WHERE parent_path = ?1 AND item_name = ?2"
                ))
                .bind(parent_path)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn get_by_hash(
        &self,
        crc32: Option<&str>,
        sha1: Option<&str>,
    ) -> Result<Vec<ItemRecord>, CacheError> {
        if crc32.is_none() && sha1.is_none() {
            return Ok(Vec::new());
        }
        let _guard = self.lock.read().await;
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM items
             WHERE (?1 IS NOT NULL AND crc32_hash = ?1)
                OR (?2 IS NOT NULL AND sha1_hash = ?2)
             ORDER BY parent_path, item_name"
        ))
        .bind(crc32)
        .bind(sha1)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn list_children(&self, parent_path: &str) -> Result<Vec<ItemRecord>, CacheError> {
        let _guard = self.lock.read().await;
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM items WHERE parent_path = ?1 ORDER BY item_name"
        ))
        .bind(parent_path)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn upsert(
        &self,
        item: &DriveItem,
        parent_path: &str,
        status: ItemStatus,
    ) -> Result<ItemRecord, CacheError> {
        let record = ItemRecord::from_item(item, parent_path, status);
        self.upsert_record(&record).await?;
        Ok(record)
    }

    /// Replaces any row sharing the id or the (parent path, name) pair.
    pub async fn upsert_record(&self, record: &ItemRecord) -> Result<(), CacheError> {
        let _guard = self.lock.write().await;
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO items ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ))
        .bind(&record.item_id)
        .bind(record.item_type.as_str())
        .bind(&record.name)
        .bind(&record.parent_id)
        .bind(&record.parent_path)
        .bind(&record.etag)
        .bind(&record.ctag)
        .bind(record.size as i64)
        .bind(record.created_time.and_then(format_timestamp))
        .bind(record.modified_time.and_then(format_timestamp))
        .bind(record.status.as_str())
        .bind(&record.crc32_hash)
        .bind(&record.sha1_hash)
        .bind(&record.sha256_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes the record addressed by `key`. With `cascade`, every record
    /// below it goes too, in the same transaction. Returns the number of
    /// rows removed.
    pub async fn delete(&self, key: ItemKey<'_>, cascade: bool) -> Result<u64, CacheError> {
        let _guard = self.lock.write().await;
        let mut tx = self.pool.begin().await?;
        let row = match key {
            ItemKey::Id(item_id) => {
                sqlx::query(&format!("SELECT {COLUMNS} FROM items WHERE item_id = ?1"))
                    .bind(item_id)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            ItemKey::Path { parent_path, name } => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM items WHERE parent_path = ?1 AND item_name = ?2"
                ))
                .bind(parent_path)
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?
            }
        };
        let Some(row) = row else {
            if cascade {
                tracing::warn!(?key, "cascading delete target is not cached");
            }
            return Ok(0);
        };
        let record = record_from_row(&row)?;

        let mut removed = 0;
        if cascade {
            let path = record.path();
            removed += sqlx::query(
                "DELETE FROM items
                 WHERE parent_id = ?1 OR parent_path = ?2 OR substr(parent_path, 1, ?3) = ?4",
            )
            .bind(&record.item_id)
            .bind(&path)
            .bind(path.chars().count() as i64 + 1)
            .bind(format!("{path}/"))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        removed += sqlx::query("DELETE FROM items WHERE item_id = ?1")
            .bind(&record.item_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn set_status(&self, item_id: &str, status: ItemStatus) -> Result<bool, CacheError> {
        let _guard = self.lock.write().await;
        let result = sqlx::query("UPDATE items SET status = ?2 WHERE item_id = ?1")
            .bind(item_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Rewrites the parent paths of everything below `old_path` after a
    /// folder was moved or renamed.
    pub async fn move_subtree(&self, old_path: &str, new_path: &str) -> Result<u64, CacheError> {
        let _guard = self.lock.write().await;
        let result = sqlx::query(
            "UPDATE items SET parent_path = ?2 || substr(parent_path, ?3)
             WHERE parent_path = ?1 OR substr(parent_path, 1, ?3) = ?4",
        )
        .bind(old_path)
        .bind(new_path)
        .bind(old_path.chars().count() as i64 + 1)
        .bind(format!("{old_path}/"))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn parse_time(value: Option<String>) -> Result<Option<OffsetDateTime>, CacheError> {
    match value {
        None => Ok(None),
        Some(value) => parse_timestamp(&value)
            .map(Some)
            .ok_or(CacheError::InvalidTimestamp(value)),
    }
}

fn record_from_row(row: &SqliteRow) -> Result<ItemRecord, CacheError> {
    let item_type: String = row.try_get("item_type")?;
    let status: String = row.try_get("status")?;
    let size: i64 = row.try_get("size")?;
    Ok(ItemRecord {
        item_id: row.try_get("item_id")?,
        item_type: ItemType::parse(&item_type)?,
        name: row.try_get("item_name")?,
        parent_id: row.try_get("parent_id")?,
        parent_path: row.try_get("parent_path")?,
        etag: row.try_get("etag")?,
        ctag: row.try_get("ctag")?,
        size: size.max(0) as u64,
        created_time: parse_time(row.try_get("created_time")?)?,
        modified_time: parse_time(row.try_get("modified_time")?)?,
        status: ItemStatus::parse(&status)?,
        crc32_hash: row.try_get("crc32_hash")?,
        sha1_hash: row.try_get("sha1_hash")?,
        sha256_hash: row.try_get("sha256_hash")?,
    })
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
