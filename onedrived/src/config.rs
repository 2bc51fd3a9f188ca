use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use onedrive_core::DEFAULT_PROBE_URL;

use crate::sync::filter::PathFilter;

const DEFAULT_SYNC_DIR_NAME: &str = "OneDrive";
const APP_DIR_NAME: &str = "onedrived";
const TOKEN_FILE_NAME: &str = "token.json";
const IGNORE_FILE_NAME: &str = "ignore_list.txt";
const DEFAULT_WORKERS: u64 = 2;
const DEFAULT_FULL_SYNC_SECS: u64 = 600;
const DEFAULT_MAX_GET_SIZE: u64 = 1024 * 1024;
const DEFAULT_MAX_PUT_SIZE: u64 = 512 * 1024;
const DEFAULT_COPY_POLL_SECS: u64 = 60;
const DEFAULT_MOVE_DELAY_SECS: u64 = 4;

/// Per-drive settings read by sync tasks.
#[derive(Clone, Debug)]
pub struct DriveConfig {
    pub local_root: PathBuf,
    /// Chunk size of ranged downloads.
    pub max_get_size_bytes: u64,
    /// Single-shot upload threshold, also the upload fragment size.
    pub max_put_size_bytes: u64,
    pub filter: PathFilter,
    /// Suffix of the local copy kept when both replicas changed.
    pub host_label: String,
    /// Hash files even when size and mtime already match.
    pub strict_hash_check: bool,
    /// Move remotely deleted entries to the trash instead of unlinking them.
    pub trash_removed: bool,
    pub copy_poll_interval: Duration,
    pub move_delay: Duration,
}

impl DriveConfig {
    pub fn new(local_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            max_get_size_bytes: DEFAULT_MAX_GET_SIZE,
            max_put_size_bytes: DEFAULT_MAX_PUT_SIZE,
            filter: PathFilter::default(),
            host_label: host_label(),
            strict_hash_check: false,
            trash_removed: true,
            copy_poll_interval: Duration::from_secs(DEFAULT_COPY_POLL_SECS),
            move_delay: Duration::from_secs(DEFAULT_MOVE_DELAY_SECS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub drive: DriveConfig,
    pub ignore_file: PathBuf,
    pub cache_dir: PathBuf,
    pub token_file: PathBuf,
    pub workers: usize,
    pub full_sync_interval: Duration,
    pub enable_local_watcher: bool,
    pub probe_url: String,
    pub api_base_url: Option<String>,
    /// Access token given directly; bypasses the token file.
    pub access_token: Option<String>,
    pub oauth: Option<OAuthSettings>,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Ok(Self::from_lookup(&home, |name| std::env::var(name).ok()))
    }

    /// Builds the config from `lookup`, which resolves `ONEDRIVED_*` names.
    pub fn from_lookup(home: &Path, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = &lookup;
        let local_root = env("ONEDRIVED_SYNC_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));
        let config_dir = env("ONEDRIVED_CONFIG_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| default_dir(dirs::config_dir(), home, ".config"));
        let cache_dir = env("ONEDRIVED_CACHE_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| default_dir(dirs::cache_dir(), home, ".cache"));
        let ignore_file = env("ONEDRIVED_IGNORE_FILE")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| config_dir.join(IGNORE_FILE_NAME));
        let token_file = env("ONEDRIVED_TOKEN_FILE")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| config_dir.join(TOKEN_FILE_NAME));

        let mut drive = DriveConfig::new(local_root);
        drive.max_get_size_bytes = read_u64_env(env, "ONEDRIVED_MAX_GET_SIZE", DEFAULT_MAX_GET_SIZE);
        drive.max_put_size_bytes = read_u64_env(env, "ONEDRIVED_MAX_PUT_SIZE", DEFAULT_MAX_PUT_SIZE);
        if let Some(label) = env("ONEDRIVED_HOST_LABEL").filter(|value| !value.trim().is_empty()) {
            drive.host_label = label.trim().to_string();
        }
        drive.strict_hash_check = read_bool_env(env, "ONEDRIVED_STRICT_HASH_CHECK", false);
        drive.trash_removed = read_bool_env(env, "ONEDRIVED_TRASH_REMOVED", true);
        drive.copy_poll_interval = Duration::from_secs(read_u64_env(
            env,
            "ONEDRIVED_COPY_POLL_SECS",
            DEFAULT_COPY_POLL_SECS,
        ));
        drive.move_delay = Duration::from_secs(read_u64_env(
            env,
            "ONEDRIVED_MOVE_DELAY_SECS",
            DEFAULT_MOVE_DELAY_SECS,
        ));

        let oauth = env("ONEDRIVED_CLIENT_ID").map(|client_id| OAuthSettings {
            client_id,
            client_secret: env("ONEDRIVED_CLIENT_SECRET"),
            redirect_uri: env("ONEDRIVED_REDIRECT_URI"),
            base_url: env("ONEDRIVED_OAUTH_BASE_URL"),
        });

        Self {
            drive,
            ignore_file,
            cache_dir,
            token_file,
            workers: read_u64_env(env, "ONEDRIVED_WORKERS", DEFAULT_WORKERS) as usize,
            full_sync_interval: Duration::from_secs(read_u64_env(
                env,
                "ONEDRIVED_FULL_SYNC_SECS",
                DEFAULT_FULL_SYNC_SECS,
            )),
            enable_local_watcher: read_bool_env(env, "ONEDRIVED_ENABLE_LOCAL_WATCHER", true),
            probe_url: env("ONEDRIVED_PROBE_URL").unwrap_or_else(|| DEFAULT_PROBE_URL.to_string()),
            api_base_url: env("ONEDRIVED_API_BASE_URL"),
            access_token: env("ONEDRIVED_TOKEN"),
            oauth,
        }
    }

    /// Cache database of one drive.
    pub fn cache_db_path(&self, drive_id: &str) -> PathBuf {
        let safe: String = drive_id
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '_' })
            .collect();
        self.cache_dir.join(format!("{safe}.db"))
    }
}

fn default_dir(base: Option<PathBuf>, home: &Path, fallback: &str) -> PathBuf {
    base.unwrap_or_else(|| home.join(fallback)).join(APP_DIR_NAME)
}

/// Host name of this machine, or `localhost` when it cannot be read.
pub fn host_label() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

pub(crate) fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(env: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> u64 {
    env(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(env: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    env(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_with(vars: &[(&str, &str)]) -> DaemonConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DaemonConfig::from_lookup(Path::new("/home/u"), |name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = config_with(&[]);

        assert_eq!(config.drive.local_root, PathBuf::from("/home/u/OneDrive"));
        assert_eq!(config.drive.max_get_size_bytes, 1024 * 1024);
        assert_eq!(config.drive.max_put_size_bytes, 512 * 1024);
        assert!(!config.drive.strict_hash_check);
        assert!(config.drive.trash_removed);
        assert_eq!(config.drive.copy_poll_interval, Duration::from_secs(60));
        assert_eq!(config.drive.move_delay, Duration::from_secs(4));
        assert_eq!(config.workers, 2);
        assert!(config.enable_local_watcher);
        assert_eq!(config.probe_url, DEFAULT_PROBE_URL);
        assert!(config.oauth.is_none());
        assert!(config.token_file.ends_with("onedrived/token.json"));
        assert!(!config.drive.host_label.is_empty());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = config_with(&[
            ("ONEDRIVED_SYNC_DIR", "~/Cloud"),
            ("ONEDRIVED_CONFIG_DIR", "/etc/od"),
            ("ONEDRIVED_WORKERS", "6"),
            ("ONEDRIVED_MAX_PUT_SIZE", "1024"),
            ("ONEDRIVED_STRICT_HASH_CHECK", "yes"),
            ("ONEDRIVED_TRASH_REMOVED", "off"),
            ("ONEDRIVED_HOST_LABEL", " desk "),
            ("ONEDRIVED_CLIENT_ID", "app"),
        ]);

        assert_eq!(config.drive.local_root, PathBuf::from("/home/u/Cloud"));
        assert_eq!(config.ignore_file, PathBuf::from("/etc/od/ignore_list.txt"));
        assert_eq!(config.workers, 6);
        assert_eq!(config.drive.max_put_size_bytes, 1024);
        assert!(config.drive.strict_hash_check);
        assert!(!config.drive.trash_removed);
        assert_eq!(config.drive.host_label, "desk");
        assert_eq!(config.oauth.unwrap().client_id, "app");
    }

    #[test]
    fn invalid_numbers_fall_back() {
        let config = config_with(&[("ONEDRIVED_WORKERS", "0"), ("ONEDRIVED_FULL_SYNC_SECS", "x")]);
        assert_eq!(config.workers, 2);
        assert_eq!(config.full_sync_interval, Duration::from_secs(600));
    }

    #[test]
    fn cache_db_name_is_sanitised() {
        let config = config_with(&[("ONEDRIVED_CACHE_DIR", "/var/cache/od")]);
        assert_eq!(
            config.cache_db_path("b!abc/12"),
            PathBuf::from("/var/cache/od/b_abc_12.db")
        );
    }

    #[test]
    fn expands_home_prefix() {
        let home = Path::new("/home/u");
        assert_eq!(expand_with_home("~", home), PathBuf::from("/home/u"));
        assert_eq!(expand_with_home("~/x", home), PathBuf::from("/home/u/x"));
        assert_eq!(expand_with_home("/abs", home), PathBuf::from("/abs"));
    }
}
