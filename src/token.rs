//! Token supervisor (component B): holds the process-wide bearer token
//! used by the upstream fetcher, refreshing it ahead of its ~5-minute
//! expiry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    #[allow(dead_code)]
    expires_in: Option<u64>,
}

/// An immutable view of the current token. Readers always see either
/// `None` (never refreshed) or a complete snapshot.
#[derive(Debug, Clone)]
struct TokenSnapshot {
    value: String,
    last_refresh: DateTime<Utc>,
}

/// Health snapshot exposed by `TokenSupervisor::health`.
#[derive(Debug, Clone)]
pub struct TokenHealth {
    pub has_token: bool,
    pub last_refresh: Option<DateTime<Utc>>,
    pub refresh_count: u64,
    pub failure_count: u64,
    pub is_refreshing: bool,
    pub is_running: bool,
}

impl TokenHealth {
    pub fn failure_rate(&self) -> f64 {
        let total = self.refresh_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.failure_count as f64 / total as f64
        }
    }
}

/// Holds the process-wide bearer token and keeps it fresh.
///
/// Concurrent `refresh()` callers coalesce through `refresh_lock`: only
/// one HTTP round trip is in flight at a time, and later callers observe
/// its outcome rather than firing a second request.
pub struct TokenSupervisor {
    client: reqwest::Client,
    token_endpoint_url: String,
    current: ArcSwapOption<TokenSnapshot>,
    refresh_lock: Mutex<()>,
    refresh_count: AtomicU64,
    failure_count: AtomicU64,
    is_refreshing: AtomicBool,
    is_running: AtomicBool,
    auto_refresh: Mutex<Option<CancellationToken>>,
}

impl TokenSupervisor {
    pub fn new(token_endpoint_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REFRESH_TIMEOUT)
                .build()
                .expect("failed to build token supervisor HTTP client"),
            token_endpoint_url: token_endpoint_url.into(),
            current: ArcSwapOption::empty(),
            refresh_lock: Mutex::new(()),
            refresh_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            is_refreshing: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            auto_refresh: Mutex::new(None),
        }
    }

    /// Returns the latest known token, or `None` if never refreshed
    /// successfully.
    pub fn current(&self) -> Option<String> {
        self.current.load_full().map(|snap| snap.value.clone())
    }

    /// One forced refresh cycle. A failing refresh is never fatal - the
    /// prior token (if any) is left in place.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let _guard = self.refresh_lock.lock().await;
        self.is_refreshing.store(true, Ordering::SeqCst);
        let result = self.do_refresh().await;
        self.is_refreshing.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => {
                self.refresh_count.fetch_add(1, Ordering::SeqCst);
                info!("token refresh succeeded");
            }
            Err(e) => {
                self.failure_count.fetch_add(1, Ordering::SeqCst);
                warn!(error = %e, "token refresh failed, keeping prior token");
            }
        }
        result
    }

    async fn do_refresh(&self) -> anyhow::Result<()> {
        let response = self
            .client
            .get(&self.token_endpoint_url)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("token endpoint request failed: {e}"))?;

        if !response.status().is_success() {
            anyhow::bail!("token endpoint returned {}", response.status());
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("token endpoint returned invalid JSON: {e}"))?;

        if body.token.is_empty() {
            anyhow::bail!("token endpoint returned an empty token");
        }

        self.current.store(Some(Arc::new(TokenSnapshot {
            value: body.token,
            last_refresh: Utc::now(),
        })));
        Ok(())
    }

    /// Launches a background task that calls `refresh()` every
    /// `interval`. Idempotent - a second call stops the previous loop
    /// first.
    pub async fn start_auto_refresh(self: &Arc<Self>, interval: Duration) {
        self.stop().await;

        let cancel = CancellationToken::new();
        *self.auto_refresh.lock().await = Some(cancel.clone());
        self.is_running.store(true, Ordering::SeqCst);

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            info!(?interval, "token auto-refresh loop starting");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = supervisor.refresh().await {
                            error!(error = %e, "scheduled token refresh failed");
                        }
                    }
                }
            }
            supervisor.is_running.store(false, Ordering::SeqCst);
            debug!("token auto-refresh loop stopped");
        });
    }

    /// Halts the background task. Safe to call at any time, including
    /// before `start_auto_refresh`.
    pub async fn stop(&self) {
        if let Some(cancel) = self.auto_refresh.lock().await.take() {
            cancel.cancel();
            self.is_running.store(false, Ordering::SeqCst);
        }
    }

    pub fn health(&self) -> TokenHealth {
        TokenHealth {
            has_token: self.current.load().is_some(),
            last_refresh: self.current.load_full().map(|snap| snap.last_refresh),
            refresh_count: self.refresh_count.load(Ordering::SeqCst),
            failure_count: self.failure_count.load(Ordering::SeqCst),
            is_refreshing: self.is_refreshing.load(Ordering::SeqCst),
            is_running: self.is_running.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn refresh_publishes_a_complete_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "abc123",
                "expiresIn": 300
            })))
            .mount(&server)
            .await;

        let supervisor = TokenSupervisor::new(format!("{}/token", server.uri()));
        assert!(supervisor.current().is_none());
        assert!(supervisor.health().last_refresh.is_none());

        supervisor.refresh().await.unwrap();
        assert_eq!(supervisor.current(), Some("abc123".to_string()));
        assert_eq!(supervisor.health().refresh_count, 1);
        assert!(supervisor.health().last_refresh.is_some());
    }

    #[tokio::test]
    async fn auto_refresh_reports_running_until_stopped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "abc123"
            })))
            .mount(&server)
            .await;

        let supervisor = Arc::new(TokenSupervisor::new(format!("{}/token", server.uri())));
        assert!(!supervisor.health().is_running);

        supervisor.start_auto_refresh(Duration::from_secs(3600)).await;
        assert!(supervisor.health().is_running);

        supervisor.stop().await;
        assert!(!supervisor.health().is_running);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_prior_token_and_never_publishes_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": ""
            })))
            .mount(&server)
            .await;

        let supervisor = TokenSupervisor::new(format!("{}/token", server.uri()));
        let result = supervisor.refresh().await;
        assert!(result.is_err());
        assert!(supervisor.current().is_none());
        assert_eq!(supervisor.health().failure_count, 1);
    }
}
