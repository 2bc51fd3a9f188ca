use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::Client;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;

pub const DEFAULT_PROBE_URL: &str = "https://onedrive.live.com";
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Parks callers while the remote store is unreachable.
///
/// Each suspended caller owns a one-shot handle. A single background loop
/// takes handles in arrival order, probes the well-known endpoint until it
/// answers, then wakes that one caller and moves on to the next.
pub struct ConnectivityMonitor {
    waiters: mpsc::UnboundedSender<oneshot::Sender<()>>,
    suspensions: AtomicU64,
}

impl ConnectivityMonitor {
    pub fn start(http: Client, probe_url: Url, retry_delay: Duration) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<oneshot::Sender<()>>();
        let handle = tokio::spawn(async move {
            while let Some(waiter) = rx.recv().await {
                while !is_reachable(&http, &probe_url).await {
                    tracing::debug!(url = %probe_url, ?retry_delay, "remote store unreachable");
                    tokio::time::sleep(retry_delay).await;
                }
                let _ = waiter.send(());
            }
        });
        let monitor = Arc::new(Self {
            waiters: tx,
            suspensions: AtomicU64::new(0),
        });
        (monitor, handle)
    }

    pub fn start_default(http: Client) -> Result<(Arc<Self>, JoinHandle<()>), url::ParseError> {
        Ok(Self::start(
            http,
            Url::parse(DEFAULT_PROBE_URL)?,
            DEFAULT_RETRY_DELAY,
        ))
    }

    /// Blocks the caller until the monitor has seen the endpoint reachable.
    pub async fn suspend_caller(&self) {
        let (tx, rx) = oneshot::channel();
        self.suspensions.fetch_add(1, Ordering::SeqCst);
        tracing::info!("connection lost, suspending until the remote store is reachable");
        if self.waiters.send(tx).is_err() {
            // Monitor loop is gone; nothing will ever wake us.
            return;
        }
        let _ = rx.await;
        tracing::info!("connection restored, resuming");
    }

    pub fn suspensions(&self) -> u64 {
        self.suspensions.load(Ordering::SeqCst)
    }
}

async fn is_reachable(http: &Client, url: &Url) -> bool {
    http.head(url.clone()).send().await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn wakes_every_suspended_caller_once_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let (monitor, handle) = ConnectivityMonitor::start(
            Client::new(),
            Url::parse(&server.uri()).unwrap(),
            Duration::from_millis(10),
        );

        let first = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.suspend_caller().await })
        };
        let second = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.suspend_caller().await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            first.await.unwrap();
            second.await.unwrap();
        })
        .await
        .expect("callers should be released");

        assert_eq!(monitor.suspensions(), 2);
        handle.abort();
    }

    #[tokio::test]
    async fn keeps_caller_parked_while_unreachable() {
        let (monitor, handle) = ConnectivityMonitor::start(
            Client::new(),
            Url::parse("http://127.0.0.1:9/").unwrap(),
            Duration::from_millis(20),
        );

        let parked = tokio::time::timeout(Duration::from_millis(200), monitor.suspend_caller()).await;

        assert!(parked.is_err(), "caller must stay suspended while offline");
        handle.abort();
    }
}
