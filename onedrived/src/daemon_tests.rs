use std::collections::HashMap;
use std::path::Path;

use super::*;
use crate::sync::cache::{ItemKey, ItemStatus};
use crate::sync::test_support::file_json;
use serde_json::json;
use tempfile::{TempDir, tempdir};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ABC_SHA1: &str = "A9993E364706816ABA3E25717850C26C9CD0D89D";

fn test_config(server: &MockServer, home: &Path, token: Option<&str>) -> DaemonConfig {
    let mut vars: HashMap<String, String> = [
        ("ONEDRIVED_SYNC_DIR", "~/OneDrive"),
        ("ONEDRIVED_CONFIG_DIR", "~/config"),
        ("ONEDRIVED_CACHE_DIR", "~/cache"),
        ("ONEDRIVED_ENABLE_LOCAL_WATCHER", "false"),
        ("ONEDRIVED_HOST_LABEL", "testhost"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    vars.insert("ONEDRIVED_API_BASE_URL".into(), server.uri());
    vars.insert("ONEDRIVED_PROBE_URL".into(), server.uri());
    if let Some(token) = token {
        vars.insert("ONEDRIVED_TOKEN".into(), token.into());
    }
    DaemonConfig::from_lookup(home, |name| vars.get(name).cloned())
}

async fn mount_drive(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/drive"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "drive-1",
            "driveType": "personal",
            "quota": {"total": 100, "used": 10, "remaining": 90, "deleted": 0, "state": "normal"}
        })))
        .mount(server)
        .await;
}

async fn mount_single_file(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/drive/root/children"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [file_json("A", "a.txt", 3, "2024-01-02T00:00:00Z", Some(ABC_SHA1))]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/items/A/content"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"abc".to_vec()))
        .mount(server)
        .await;
}

async fn started(server: &MockServer, token: Option<&str>) -> (DaemonRuntime, TempDir) {
    mount_drive(server).await;
    let home = tempdir().unwrap();
    let config = test_config(server, home.path(), token);
    let runtime = DaemonRuntime::bootstrap(config).await.unwrap();
    (runtime, home)
}

#[tokio::test]
async fn bootstrap_opens_cache_named_after_drive() {
    let server = MockServer::start().await;
    let (runtime, home) = started(&server, Some("env-token")).await;

    assert!(home.path().join("OneDrive").is_dir());
    assert!(home.path().join("cache/drive-1.db").exists());
    assert!(!home.path().join("config/token.json").exists());
    assert_eq!(runtime.context().drive.host_label, "testhost");
}

#[tokio::test]
async fn bootstrap_requires_a_token() {
    let server = MockServer::start().await;
    mount_drive(&server).await;
    let home = tempdir().unwrap();

    let err = DaemonRuntime::bootstrap(test_config(&server, home.path(), None))
        .await
        .err()
        .unwrap();

    assert!(err.to_string().contains("no token found"));
}

#[tokio::test]
async fn token_file_is_loaded_and_persisted() {
    let server = MockServer::start().await;
    mount_drive(&server).await;
    let home = tempdir().unwrap();
    let config = test_config(&server, home.path(), None);
    let storage = TokenStorage::new(&config.token_file);
    storage
        .save_oauth_state(&OAuthState::from_access_token("stored"))
        .await
        .unwrap();

    let runtime = DaemonRuntime::bootstrap(config).await.unwrap();
    runtime
        .run_until(RunMode::Continuous, async {})
        .await
        .unwrap();

    let saved = storage.get_oauth_state().await.unwrap();
    assert_eq!(saved.access_token, "stored");
}

#[tokio::test]
async fn once_mode_finishes_a_full_pass() {
    let server = MockServer::start().await;
    mount_single_file(&server).await;
    let (runtime, home) = started(&server, Some("env-token")).await;
    let ctx = Arc::clone(runtime.context());

    tokio::time::timeout(
        Duration::from_secs(10),
        runtime.run_until(RunMode::Once, std::future::pending()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(std::fs::read(home.path().join("OneDrive/a.txt")).unwrap(), b"abc");
    let record = ctx.cache.get(ItemKey::Id("A")).await.unwrap().unwrap();
    assert_eq!(record.status, ItemStatus::Downloaded);
    assert!(ctx.queue.is_terminated());
}

#[tokio::test]
async fn continuous_mode_seeds_root_and_stops_on_shutdown() {
    let server = MockServer::start().await;
    mount_single_file(&server).await;
    let (runtime, home) = started(&server, Some("env-token")).await;
    let ctx = Arc::clone(runtime.context());
    let file = home.path().join("OneDrive/a.txt");

    let shutdown = async {
        while !file.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(
        Duration::from_secs(10),
        runtime.run_until(RunMode::Continuous, shutdown),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(ctx.queue.is_terminated());
}

#[test]
fn oauth_client_is_optional() {
    assert!(oauth_client_from_settings(None).unwrap().is_none());

    let settings = OAuthSettings {
        client_id: "app".into(),
        client_secret: Some("secret".into()),
        redirect_uri: None,
        base_url: Some("http://127.0.0.1:9/".into()),
    };
    assert!(oauth_client_from_settings(Some(&settings)).unwrap().is_some());
}
