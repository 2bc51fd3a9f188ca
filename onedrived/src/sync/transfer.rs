use std::io::SeekFrom;
use std::path::Path;

use futures_util::StreamExt;
use onedrive_core::{
    ConflictBehavior, DriveError, DriveItem, ItemLocator, ItemPatch, UploadProgress, remote_path,
};
use reqwest::StatusCode;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::cache::ItemStatus;
use super::engine::{SyncContext, SyncError};
use super::local;
use super::task::Task;

/// Fetches `item` into the task's path through a hidden partial file.
/// On failure the partial file is removed and the target is untouched.
pub async fn download(ctx: &SyncContext, task: &Task, item: &DriveItem) -> Result<(), SyncError> {
    let path = task.path();
    let target = ctx.local_path(&path)?;
    let parent = ctx.local_path(&task.parent)?;
    tokio::fs::create_dir_all(&parent).await?;
    let partial = parent.join(local::partial_name(&task.name));

    if let Err(err) = fetch_to(ctx, item, &partial, &path).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(err);
    }
    tokio::fs::rename(&partial, &target).await?;
    if let Some(modified) = item.client_modified_time() {
        local::set_modified(&target, modified).await?;
    }
    ctx.cache
        .upsert(item, &remote_path(&task.parent), ItemStatus::Downloaded)
        .await?;
    tracing::info!(path = %path, size = item.size, "downloaded");
    Ok(())
}

async fn fetch_to(
    ctx: &SyncContext,
    item: &DriveItem,
    partial: &Path,
    path: &str,
) -> Result<(), SyncError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut sha1 = Sha1::new();
    let mut written = 0u64;
    let chunk = ctx.drive.max_get_size_bytes.max(1);

    while written < item.size {
        let end = (written + chunk).min(item.size) - 1;
        let response = ctx.client.download_range(&item.id, written, end).await?;
        let whole_body = response.status() == StatusCode::OK;
        if whole_body && written > 0 {
            file.set_len(0).await?;
            file.seek(SeekFrom::Start(0)).await?;
            sha1 = Sha1::new();
            written = 0;
        }
        let before = written;
        let mut stream = response.bytes_stream();
        while let Some(bytes) = stream.next().await {
            let bytes = bytes.map_err(DriveError::from)?;
            file.write_all(&bytes).await?;
            sha1.update(&bytes);
            written += bytes.len() as u64;
        }
        if whole_body || written == before {
            break;
        }
    }
    file.flush().await?;
    file.sync_all().await?;

    if written != item.size {
        return Err(SyncError::SizeMismatch {
            path: path.to_string(),
            expected: item.size,
            actual: written,
        });
    }
    if let Some(expected) = item.hashes().and_then(|hashes| hashes.sha1_hash.as_deref()) {
        let actual = hex::encode_upper(sha1.finalize());
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(SyncError::HashMismatch {
                path: path.to_string(),
                expected: expected.to_ascii_uppercase(),
                actual,
            });
        }
    }
    Ok(())
}

/// Sends the local file at the task's path, then stamps the remote copy
/// with the local mtime.
pub async fn upload(ctx: &SyncContext, task: &Task) -> Result<(), SyncError> {
    let path = task.path();
    let source = ctx.local_path(&path)?;
    let Some(entry) = local::stat(&source).await? else {
        tracing::info!(path = %path, "file vanished before upload");
        return Ok(());
    };
    if entry.is_dir {
        tracing::warn!(path = %path, "upload target is a directory, skipping");
        return Ok(());
    }

    let threshold = ctx.drive.max_put_size_bytes.max(1);
    let item = if entry.size <= threshold {
        let content = tokio::fs::read(&source).await?;
        ctx.client
            .upload_small(&task.parent, &task.name, content, ConflictBehavior::Replace)
            .await?
    } else {
        upload_in_session(ctx, task, &source, entry.size, threshold).await?
    };

    let item = match entry.modified {
        Some(modified) => {
            ctx.client
                .update_item(
                    &ItemLocator::Id(item.id.clone()),
                    &ItemPatch::modified_at(modified),
                )
                .await?
        }
        None => item,
    };
    ctx.cache
        .upsert(&item, &remote_path(&task.parent), ItemStatus::Uploaded)
        .await?;
    tracing::info!(path = %path, size = entry.size, "uploaded");
    Ok(())
}

async fn upload_in_session(
    ctx: &SyncContext,
    task: &Task,
    source: &Path,
    size: u64,
    fragment: u64,
) -> Result<DriveItem, SyncError> {
    let mut session = ctx
        .client
        .create_upload_session(&task.parent, &task.name, ConflictBehavior::Replace)
        .await?;
    let mut file = tokio::fs::File::open(source).await?;
    loop {
        let range = session
            .next_ranges()
            .first()
            .copied()
            .filter(|range| range.start < size)
            .ok_or_else(|| {
                DriveError::MalformedResponse("upload session has no usable range".into())
            })?;
        let last = range.end.map_or(size - 1, |end| end.min(size - 1));
        let wanted = last
            .checked_sub(range.start)
            .map(|span| span + 1)
            .ok_or_else(|| {
                DriveError::MalformedResponse(format!(
                    "upload session range ends before it starts: {}-{last}",
                    range.start
                ))
            })?;
        let len = wanted.min(fragment) as usize;
        let mut chunk = vec![0u8; len];
        file.seek(SeekFrom::Start(range.start)).await?;
        file.read_exact(&mut chunk).await?;
        tracing::debug!(path = %task.path(), start = range.start, len, "sending fragment");

        match ctx
            .client
            .upload_fragment(&session, chunk, range.start, size)
            .await?
        {
            UploadProgress::Pending(next) => session = next,
            UploadProgress::Complete(item) => return Ok(*item),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::cache::ItemKey;
    use crate::sync::task::TaskAction;
    use crate::sync::test_support::{context, file_json, item};
    use onedrive_core::parse_timestamp;
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODIFIED: &str = "2024-01-02T00:00:00Z";

    fn download_task(value: serde_json::Value, at: &str) -> (Task, DriveItem) {
        let item = item(value);
        let task = Task::at(
            at,
            TaskAction::Download {
                item: Box::new(item.clone()),
            },
        );
        (task, item)
    }

    #[tokio::test]
    async fn downloads_in_ranged_chunks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/items/A/content"))
            .and(header("range", "bytes=0-3"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"abcd".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/items/A/content"))
            .and(header("range", "bytes=4-5"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"ef".to_vec()))
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Docs")).unwrap();
        let ctx = context(&server, dir.path()).await;
        let sha1 = "1f8ac10f23c5b5bc1167bda84b833e5c057a77d2";
        let (task, item) = download_task(file_json("A", "a.txt", 6, MODIFIED, Some(sha1)), "/Docs/a.txt");

        download(&ctx, &task, &item).await.unwrap();

        let target = dir.path().join("Docs/a.txt");
        assert_eq!(std::fs::read(&target).unwrap(), b"abcdef");
        assert!(!dir.path().join("Docs/.a.txt.!od").exists());
        let entry = local::stat(&target).await.unwrap().unwrap();
        assert!(local::same_mtime(entry.modified, parse_timestamp(MODIFIED)));
        let record = ctx.cache.get(ItemKey::Id("A")).await.unwrap().unwrap();
        assert_eq!(record.status, ItemStatus::Downloaded);
        assert_eq!(record.parent_path.as_deref(), Some("/drive/root:/Docs"));
    }

    #[tokio::test]
    async fn whole_body_reply_is_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/items/A/content"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abcdef".to_vec()))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let ctx = context(&server, dir.path()).await;
        let (task, item) = download_task(file_json("A", "a.txt", 6, MODIFIED, None), "/a.txt");

        download(&ctx, &task, &item).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn hash_mismatch_leaves_target_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/items/A/content"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"original").unwrap();
        let ctx = context(&server, dir.path()).await;
        let (task, item) =
            download_task(file_json("A", "a.txt", 3, MODIFIED, Some("DEADBEEF")), "/a.txt");

        let err = download(&ctx, &task, &item).await.unwrap_err();

        assert!(matches!(err, SyncError::HashMismatch { .. }));
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"original");
        assert!(!dir.path().join(".a.txt.!od").exists());
        assert!(ctx.cache.get(ItemKey::Id("A")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn short_body_is_a_size_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/items/A/content"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ab".to_vec()))
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let ctx = context(&server, dir.path()).await;
        let (task, item) = download_task(file_json("A", "a.txt", 3, MODIFIED, None), "/a.txt");

        let err = download(&ctx, &task, &item).await.unwrap_err();

        assert!(matches!(err, SyncError::SizeMismatch { expected: 3, actual: 2, .. }));
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn empty_ranged_reply_stops_the_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/items/A/content"))
            .and(header("range", "bytes=0-3"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"abcd".to_vec()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/items/A/content"))
            .and(header("range", "bytes=4-5"))
            .respond_with(ResponseTemplate::new(206))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let ctx = context(&server, dir.path()).await;
        let (task, item) = download_task(file_json("A", "a.txt", 6, MODIFIED, None), "/a.txt");

        let err = tokio::time::timeout(std::time::Duration::from_secs(5), download(&ctx, &task, &item))
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, SyncError::SizeMismatch { expected: 6, actual: 4, .. }));
        assert!(!dir.path().join("a.txt").exists());
        assert!(!dir.path().join(".a.txt.!od").exists());
    }

    #[tokio::test]
    async fn small_file_is_put_then_stamped() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/drive/root:/a.txt:/content"))
            .and(body_bytes(b"abc".to_vec()))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(file_json("U1", "a.txt", 3, "2030-01-01T00:00:00Z", None)),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/drive/items/U1"))
            .and(wiremock::matchers::body_json(json!({
                "fileSystemInfo": {"lastModifiedDateTime": MODIFIED}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(file_json("U1", "a.txt", 3, MODIFIED, None)))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"abc").unwrap();
        local::set_modified(&file, parse_timestamp(MODIFIED).unwrap())
            .await
            .unwrap();
        let ctx = context(&server, dir.path()).await;

        upload(&ctx, &Task::at("/a.txt", TaskAction::Upload)).await.unwrap();

        let record = ctx.cache.get(ItemKey::Id("U1")).await.unwrap().unwrap();
        assert_eq!(record.status, ItemStatus::Uploaded);
        assert_eq!(record.modified_time, parse_timestamp(MODIFIED));
    }

    #[tokio::test]
    async fn large_file_uses_upload_session() {
        let server = MockServer::start().await;
        let upload_url = format!("{}/upload/s1", server.uri());
        Mock::given(method("POST"))
            .and(path("/drive/root:/big.bin:/createUploadSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uploadUrl": upload_url,
                "nextExpectedRanges": ["0-"]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload/s1"))
            .and(header("content-range", "bytes 0-3/6"))
            .and(body_bytes(b"abcd".to_vec()))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "nextExpectedRanges": ["4-"]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload/s1"))
            .and(header("content-range", "bytes 4-5/6"))
            .and(body_bytes(b"ef".to_vec()))
            .respond_with(ResponseTemplate::new(201).set_body_json(file_json("BIG", "big.bin", 6, MODIFIED, None)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/drive/items/BIG"))
            .respond_with(ResponseTemplate::new(200).set_body_json(file_json("BIG", "big.bin", 6, MODIFIED, None)))
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("big.bin"), b"abcdef").unwrap();
        let ctx = context(&server, dir.path()).await;

        upload(&ctx, &Task::at("/big.bin", TaskAction::Upload)).await.unwrap();

        let record = ctx.cache.get(ItemKey::Id("BIG")).await.unwrap().unwrap();
        assert_eq!(record.size, 6);
    }

    #[tokio::test]
    async fn inverted_session_range_is_rejected() {
        let server = MockServer::start().await;
        let upload_url = format!("{}/upload/s1", server.uri());
        Mock::given(method("POST"))
            .and(path("/drive/root:/big.bin:/createUploadSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uploadUrl": upload_url,
                "nextExpectedRanges": ["5-2"]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload/s1"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("big.bin"), b"abcdef").unwrap();
        let ctx = context(&server, dir.path()).await;

        let err = upload(&ctx, &Task::at("/big.bin", TaskAction::Upload))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SyncError::Drive(DriveError::MalformedResponse(_))
        ));
        assert!(ctx.cache.get(ItemKey::Id("BIG")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn vanished_file_is_not_an_error() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let ctx = context(&server, dir.path()).await;

        upload(&ctx, &Task::at("/missing.txt", TaskAction::Upload))
            .await
            .unwrap();

        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
