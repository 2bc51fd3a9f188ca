use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use onedrive_core::{
    ConnectivityMonitor, DEFAULT_RETRY_DELAY, Drive, DriveClient, OAuthClient, OAuthState,
    RetryingTransport, TokenProvider,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{DaemonConfig, OAuthSettings};
use crate::storage::{StorageError, TokenStorage};
use crate::sync::cache::ItemCache;
use crate::sync::engine::SyncContext;
use crate::sync::filter::PathFilter;
use crate::sync::local_watcher::{EventPlanner, start_notify_watcher};
use crate::sync::scheduler::TaskQueue;
use crate::sync::task::Task;
use crate::sync::worker::WorkerPool;

const IDLE_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Re-seed full passes until interrupted.
    Continuous,
    /// One full pass, then exit once the queue drains.
    Once,
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    ctx: Arc<SyncContext>,
    storage: TokenStorage,
    persist_tokens: bool,
    monitor_handle: Option<JoinHandle<()>>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.drive.local_root)
            .await
            .with_context(|| format!("failed to create sync root at {:?}", config.drive.local_root))?;

        let storage = TokenStorage::new(&config.token_file);
        let state = resolve_token_state(&config, &storage).await?;
        let oauth_client = oauth_client_from_settings(config.oauth.as_ref())?;

        let http = reqwest::Client::new();
        let probe_url = Url::parse(&config.probe_url).context("invalid probe url")?;
        let (monitor, monitor_handle) =
            ConnectivityMonitor::start(http.clone(), probe_url, DEFAULT_RETRY_DELAY);
        let transport = Arc::new(RetryingTransport::new(
            http,
            TokenProvider::new(state, oauth_client),
            monitor,
        ));
        let client = match config.api_base_url.as_deref() {
            Some(url) => DriveClient::with_base_url(url, transport),
            None => DriveClient::new(transport),
        }
        .context("invalid api base url")?;

        let drive = client.get_drive().await.context("failed to fetch drive")?;
        log_quota(&drive);

        let cache_path = config.cache_db_path(&drive.id);
        let cache = ItemCache::open(&cache_path)
            .await
            .with_context(|| format!("failed to open item cache at {cache_path:?}"))?;

        let mut drive_config = config.drive.clone();
        drive_config.filter = PathFilter::load(&config.ignore_file)
            .await
            .with_context(|| format!("failed to read ignore file {:?}", config.ignore_file))?;
        tracing::debug!(rules = drive_config.filter.len(), "ignore rules loaded");

        let ctx = Arc::new(SyncContext::new(
            client,
            cache,
            Arc::new(TaskQueue::new()),
            drive_config,
        ));
        let persist_tokens = config.access_token.is_none();
        let runtime = Self {
            config,
            ctx,
            storage,
            persist_tokens,
            monitor_handle: Some(monitor_handle),
        };
        runtime.save_token_state().await;
        Ok(runtime)
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub async fn run(self, mode: RunMode) -> anyhow::Result<()> {
        self.run_until(mode, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed waiting for shutdown signal");
            }
            tracing::info!("shutdown requested");
        })
        .await
    }

    /// Runs until `shutdown` resolves or, in [`RunMode::Once`], until the
    /// seeded pass has finished.
    pub async fn run_until<F>(mut self, mode: RunMode, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            root = %self.config.drive.local_root.display(),
            workers = self.config.workers,
            ?mode,
            local_watcher = self.config.enable_local_watcher,
            "daemon started"
        );
        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(Arc::clone(&self.ctx), self.config.workers);
        let mut loops: Vec<JoinHandle<()>> = Vec::new();
        let mut watcher = None;

        match mode {
            RunMode::Once => {
                self.ctx.enqueue(Task::merge_root());
            }
            RunMode::Continuous => {
                loops.push(spawn_reseed_loop(
                    Arc::clone(&self.ctx),
                    self.config.full_sync_interval,
                    cancel.child_token(),
                ));
                if self.config.enable_local_watcher {
                    match start_notify_watcher(&self.config.drive.local_root) {
                        Ok((handle, events)) => {
                            watcher = Some(handle);
                            let planner = EventPlanner::new(Arc::clone(&self.ctx));
                            loops.push(tokio::spawn(planner.run(events, cancel.child_token())));
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to start local watcher");
                        }
                    }
                }
            }
        }

        match mode {
            RunMode::Once => {
                tokio::select! {
                    _ = shutdown => {}
                    _ = wait_until_idle(&self.ctx.queue) => {
                        tracing::info!("full pass finished");
                    }
                }
            }
            RunMode::Continuous => shutdown.await,
        }

        cancel.cancel();
        for handle in loops {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "background loop ended abnormally");
            }
        }
        drop(watcher);
        pool.shutdown().await;
        self.save_token_state().await;
        if let Some(handle) = self.monitor_handle.take() {
            handle.abort();
        }
        tracing::info!("daemon stopped");
        Ok(())
    }

    async fn save_token_state(&self) {
        if !self.persist_tokens {
            return;
        }
        let state = self.ctx.client.transport().token_state().await;
        if let Err(err) = self.storage.save_oauth_state(&state).await {
            tracing::warn!(path = %self.storage.path().display(), error = %err, "failed to persist token state");
        }
    }
}

/// Seeds the root merge immediately and then every `interval`, skipping a
/// tick while the previous root pass is still queued.
fn spawn_reseed_loop(
    ctx: Arc<SyncContext>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let root = Task::merge_root();
            if ctx.queue.has_pending_task(&root.path()) {
                tracing::debug!("root pass still pending, skipping re-seed");
                continue;
            }
            if ctx.enqueue(root) {
                tracing::info!("full sync pass scheduled");
            }
        }
    })
}

async fn wait_until_idle(queue: &TaskQueue) {
    loop {
        tokio::time::sleep(IDLE_POLL).await;
        if queue.is_idle() {
            return;
        }
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
