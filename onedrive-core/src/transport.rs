use std::sync::Arc;
use std::time::{Duration, SystemTime};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::sync::Mutex;

use crate::connectivity::ConnectivityMonitor;
use crate::error::{DriveError, is_connection_failure, is_recoverable_status};
use crate::session::{OAuthState, TokenProvider};

pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Attach the bearer token. Pre-authorised URLs (upload sessions, copy
    /// monitors) must not receive it.
    pub authorize: bool,
    pub auto_renew: bool,
}

impl CallOptions {
    pub const fn anonymous() -> Self {
        Self {
            authorize: false,
            auto_renew: false,
        }
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            authorize: true,
            auto_renew: true,
        }
    }
}

/// Runs every remote call in a retry loop.
///
/// Connection failures park the caller on the [`ConnectivityMonitor`] and
/// recoverable responses sleep for `Retry-After`; neither is bounded. An
/// expired credential is renewed at most once per call.
pub struct RetryingTransport {
    http: Client,
    tokens: Mutex<TokenProvider>,
    monitor: Arc<ConnectivityMonitor>,
    default_retry_after: Duration,
}

impl RetryingTransport {
    pub fn new(http: Client, tokens: TokenProvider, monitor: Arc<ConnectivityMonitor>) -> Self {
        Self {
            http,
            tokens: Mutex::new(tokens),
            monitor,
            default_retry_after: DEFAULT_RETRY_AFTER,
        }
    }

    pub fn with_default_retry_after(mut self, delay: Duration) -> Self {
        self.default_retry_after = delay;
        self
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub async fn token_state(&self) -> OAuthState {
        self.tokens.lock().await.state().clone()
    }

    /// `build` is invoked once per attempt, so bodies must be rebuildable.
    pub async fn send<F>(&self, options: CallOptions, build: F) -> Result<Response, DriveError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut renewed = false;
        loop {
            let mut request = build(&self.http);
            let mut used_token = None;
            if options.authorize {
                let token = self.tokens.lock().await.valid_access_token().await?;
                request = request.bearer_auth(&token);
                used_token = Some(token);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) if is_connection_failure(&err) => {
                    tracing::warn!(error = %err, "remote store unreachable");
                    self.monitor.suspend_caller().await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if is_recoverable_status(status) {
                let delay = retry_after(response.headers()).unwrap_or(self.default_retry_after);
                tracing::warn!(%status, delay_ms = delay.as_millis() as u64, "recoverable response, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
            if status == StatusCode::UNAUTHORIZED && options.authorize {
                if !options.auto_renew {
                    return Err(DriveError::TokenExpired);
                }
                if !renewed && self.renew(used_token.as_deref()).await? {
                    renewed = true;
                    continue;
                }
                if !renewed {
                    return Err(DriveError::TokenExpired);
                }
            }
            return Err(DriveError::from_response(response).await);
        }
    }

    /// Returns false when no renewal is possible. A token already replaced by
    /// another caller counts as renewed.
    async fn renew(&self, used_token: Option<&str>) -> Result<bool, DriveError> {
        let mut tokens = self.tokens.lock().await;
        if used_token.is_some_and(|used| used != tokens.state().access_token) {
            return Ok(true);
        }
        if !tokens.can_refresh() {
            return Ok(false);
        }
        tokens.refresh_now().await?;
        Ok(true)
    }
}

/// `Retry-After` as either delta-seconds or an HTTP-date.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
}
