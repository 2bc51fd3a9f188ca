use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Drive {
    pub id: String,
    #[serde(default)]
    pub drive_type: Option<String>,
    #[serde(default)]
    pub quota: Option<Quota>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub remaining: u64,
    #[serde(default)]
    pub deleted: u64,
    #[serde(default)]
    pub state: Option<String>,
}

/// Snapshot of a remote file or folder.
///
/// Only `id` and `name` are always present; every facet is optional and
/// checked through the `is_*`/`hashes` helpers.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub e_tag: Option<String>,
    #[serde(default)]
    pub c_tag: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub created_date_time: Option<String>,
    #[serde(default)]
    pub last_modified_date_time: Option<String>,
    #[serde(default)]
    pub parent_reference: Option<ItemReference>,
    #[serde(default)]
    pub file: Option<FileFacet>,
    #[serde(default)]
    pub folder: Option<FolderFacet>,
    #[serde(default)]
    pub file_system_info: Option<FileSystemInfo>,
}

impl DriveItem {
    pub fn is_folder(&self) -> bool {
        self.folder.is_some()
    }

    pub fn is_file(&self) -> bool {
        self.file.is_some() && self.folder.is_none()
    }

    pub fn hashes(&self) -> Option<&Hashes> {
        self.file.as_ref().and_then(|file| file.hashes.as_ref())
    }

    /// Modification time as reported by the client that wrote the item,
    /// falling back to the server-side timestamp.
    pub fn client_modified_time(&self) -> Option<OffsetDateTime> {
        self.file_system_info
            .as_ref()
            .and_then(|info| info.last_modified_date_time.as_deref())
            .or(self.last_modified_date_time.as_deref())
            .and_then(parse_timestamp)
    }

    pub fn created_time(&self) -> Option<OffsetDateTime> {
        self.file_system_info
            .as_ref()
            .and_then(|info| info.created_date_time.as_deref())
            .or(self.created_date_time.as_deref())
            .and_then(parse_timestamp)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ItemReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileFacet {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub hashes: Option<Hashes>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Hashes {
    #[serde(default)]
    pub crc32_hash: Option<String>,
    #[serde(default)]
    pub sha1_hash: Option<String>,
    #[serde(default)]
    pub sha256_hash: Option<String>,
}

impl Hashes {
    pub fn is_empty(&self) -> bool {
        self.crc32_hash.is_none() && self.sha1_hash.is_none() && self.sha256_hash.is_none()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacet {
    #[serde(default)]
    pub child_count: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_date_time: Option<String>,
}

impl FileSystemInfo {
    pub fn modified_at(modified: OffsetDateTime) -> Self {
        Self {
            created_date_time: None,
            last_modified_date_time: format_timestamp(modified),
        }
    }
}

/// Body of an item PATCH; absent fields are left untouched remotely.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ItemPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_reference: Option<ItemReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_system_info: Option<FileSystemInfo>,
}

impl ItemPatch {
    pub fn modified_at(modified: OffsetDateTime) -> Self {
        Self {
            file_system_info: Some(FileSystemInfo::modified_at(modified)),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemPage {
    #[serde(default)]
    pub value: Vec<DriveItem>,
    #[serde(default, rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictBehavior {
    Fail,
    Replace,
    Rename,
}

impl ConflictBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictBehavior::Fail => "fail",
            ConflictBehavior::Replace => "replace",
            ConflictBehavior::Rename => "rename",
        }
    }
}

/// Addresses a remote item either by id or by its path relative to the
/// drive root (`/Docs/a.txt`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemLocator {
    Id(String),
    Path(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive end; `None` means "through the end of the file".
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn parse(value: &str) -> Option<Self> {
        let (start, end) = value.trim().split_once('-')?;
        let start = start.parse::<u64>().ok()?;
        let end = if end.is_empty() {
            None
        } else {
            Some(end.parse::<u64>().ok()?)
        };
        Some(Self { start, end })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub upload_url: String,
    #[serde(default)]
    pub expiration_date_time: Option<String>,
    #[serde(default)]
    pub next_expected_ranges: Vec<String>,
}

impl UploadSession {
    pub fn next_ranges(&self) -> Vec<ByteRange> {
        self.next_expected_ranges
            .iter()
            .filter_map(|range| ByteRange::parse(range))
            .collect()
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expiration_date_time.as_deref().and_then(parse_timestamp)
    }

    pub(crate) fn apply(&mut self, status: UploadSessionStatus) {
        if let Some(url) = status.upload_url {
            self.upload_url = url;
        }
        if status.expiration_date_time.is_some() {
            self.expiration_date_time = status.expiration_date_time;
        }
        self.next_expected_ranges = status.next_expected_ranges;
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadSessionStatus {
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub expiration_date_time: Option<String>,
    #[serde(default)]
    pub next_expected_ranges: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum UploadProgress {
    Pending(UploadSession),
    Complete(Box<DriveItem>),
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AsyncOperationStatus {
    NotStarted,
    Completed,
    Failed,
    #[serde(other)]
    InProgress,
}

impl AsyncOperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AsyncOperationStatus::Completed | AsyncOperationStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AsyncOperationProgress {
    pub status: AsyncOperationStatus,
    #[serde(default)]
    pub percentage_complete: f64,
    #[serde(default)]
    pub resource_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AsyncCopySession {
    pub monitor_url: String,
    pub status: AsyncOperationStatus,
    pub percentage_complete: f64,
    pub resource_id: Option<String>,
    pub item: Option<Box<DriveItem>>,
}

impl AsyncCopySession {
    pub fn new(monitor_url: impl Into<String>) -> Self {
        Self {
            monitor_url: monitor_url.into(),
            status: AsyncOperationStatus::NotStarted,
            percentage_complete: 0.0,
            resource_id: None,
            item: None,
        }
    }
}

pub fn parse_timestamp(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).ok()
}

pub fn format_timestamp(value: OffsetDateTime) -> Option<String> {
    value.format(&Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_open_and_closed_ranges() {
        assert_eq!(
            ByteRange::parse("0-99"),
            Some(ByteRange {
                start: 0,
                end: Some(99)
            })
        );
        assert_eq!(
            ByteRange::parse("128-"),
            Some(ByteRange {
                start: 128,
                end: None
            })
        );
        assert_eq!(ByteRange::parse("bogus"), None);
    }

    #[test]
    fn unknown_copy_status_counts_as_in_progress() {
        let progress: AsyncOperationProgress =
            serde_json::from_value(json!({"status": "waiting", "percentageComplete": 12.5}))
                .unwrap();
        assert_eq!(progress.status, AsyncOperationStatus::InProgress);
        assert!(!progress.status.is_terminal());
    }

    #[test]
    fn known_copy_statuses_parse_by_name() {
        let parse = |status: &str| {
            serde_json::from_value::<AsyncOperationProgress>(json!({"status": status}))
                .unwrap()
                .status
        };
        assert_eq!(parse("notStarted"), AsyncOperationStatus::NotStarted);
        assert_eq!(parse("inProgress"), AsyncOperationStatus::InProgress);
        assert_eq!(parse("completed"), AsyncOperationStatus::Completed);
        assert_eq!(parse("failed"), AsyncOperationStatus::Failed);
        assert!(parse("failed").is_terminal());
    }

    #[test]
    fn client_modified_time_prefers_file_system_info() {
        let item: DriveItem = serde_json::from_value(json!({
            "id": "A1",
            "name": "a.txt",
            "size": 3,
            "lastModifiedDateTime": "2024-05-01T10:00:00Z",
            "fileSystemInfo": {"lastModifiedDateTime": "2023-01-02T03:04:05Z"},
            "file": {"hashes": {"sha1Hash": "ABC"}}
        }))
        .unwrap();

        let modified = item.client_modified_time().unwrap();
        assert_eq!(modified.unix_timestamp(), 1_672_628_645);
        assert!(item.is_file());
        assert_eq!(
            item.hashes().and_then(|h| h.sha1_hash.as_deref()),
            Some("ABC")
        );
    }
}
