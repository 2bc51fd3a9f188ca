use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use onedrive_core::{
    ConnectivityMonitor, DriveClient, DriveItem, OAuthState, RetryingTransport, TokenProvider,
};
use reqwest::Client;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use url::Url;
use wiremock::MockServer;

use super::cache::ItemCache;
use super::engine::SyncContext;
use super::scheduler::TaskQueue;
use crate::config::DriveConfig;

pub async fn context(server: &MockServer, root: &Path) -> SyncContext {
    let http = Client::new();
    let (monitor, _handle) = ConnectivityMonitor::start(
        http.clone(),
        Url::parse(&server.uri()).unwrap(),
        Duration::from_millis(10),
    );
    let tokens = TokenProvider::new(OAuthState::from_access_token("test-token"), None);
    let transport = RetryingTransport::new(http, tokens, monitor)
        .with_default_retry_after(Duration::from_millis(10));
    let client = DriveClient::with_base_url(&server.uri(), Arc::new(transport)).unwrap();

    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let cache = ItemCache::from_pool(pool);
    cache.init().await.unwrap();

    let mut drive = DriveConfig::new(root);
    drive.host_label = "testhost".into();
    drive.max_get_size_bytes = 4;
    drive.max_put_size_bytes = 4;
    drive.copy_poll_interval = Duration::from_millis(10);
    drive.move_delay = Duration::from_millis(10);
    SyncContext::new(client, cache, Arc::new(TaskQueue::new()), drive)
}

pub fn file_json(id: &str, name: &str, size: u64, modified: &str, sha1: Option<&str>) -> Value {
    let mut hashes = json!({});
    if let Some(sha1) = sha1 {
        hashes["sha1Hash"] = json!(sha1);
    }
    json!({
        "id": id,
        "name": name,
        "size": size,
        "eTag": format!("etag-{id}"),
        "cTag": format!("ctag-{id}"),
        "file": {"hashes": hashes},
        "fileSystemInfo": {
            "createdDateTime": modified,
            "lastModifiedDateTime": modified
        }
    })
}

pub fn folder_json(id: &str, name: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "eTag": format!("etag-{id}"),
        "cTag": format!("ctag-{id}"),
        "folder": {"childCount": 0}
    })
}

pub fn item(value: Value) -> DriveItem {
    serde_json::from_value(value).unwrap()
}
