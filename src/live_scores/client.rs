use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rand::Rng;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::provider::{MatchSource, VendorAdapter};
use super::ExternalMatch;
use crate::db::models::Sport;

/// Longest date range fetched day by day in one call.
const MAX_RANGE_DAYS: i64 = 14;

#[derive(Error, Debug)]
pub enum VendorError {
    #[error("rate limited")]
    RateLimited,

    #[error("HTTP {0}")]
    Status(StatusCode),

    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("vendor reported errors: {0}")]
    Api(String),
}

impl VendorError {
    /// Rate limits, 5xx and network hiccups are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            VendorError::RateLimited => true,
            VendorError::Status(status) => status.is_server_error(),
            VendorError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            VendorError::Api(_) => false,
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        let jitter_ms = self.base_delay.as_millis() as u64 / 2;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        capped + jitter
    }
}

/// REST client for the API-Sports family, parameterized by the adapter that
/// knows the vendor's resource name and payload shape.
pub struct ApiSportsClient<A> {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
    adapter: A,
    retry: RetryPolicy,
}

impl<A: VendorAdapter> ApiSportsClient<A> {
    pub fn new(
        adapter: A,
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .with_context(|| format!("Invalid base URL for {}: {}", adapter.name(), base_url))?;
        Ok(ApiSportsClient {
            http,
            base_url,
            api_key,
            adapter,
            retry,
        })
    }

    fn endpoint(&self, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self.base_url.join(self.adapter.resource())?;
        {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn fetch_once(&self, url: &Url) -> Result<serde_json::Value, VendorError> {
        let mut req = self.http.get(url.clone());
        if let Some(key) = &self.api_key {
            req = req.header("x-apisports-key", key);
        }
        let resp = req.send().await?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(VendorError::RateLimited);
        }
        if !status.is_success() {
            return Err(VendorError::Status(status));
        }

        let body: serde_json::Value = resp.json().await?;
        check_body_errors(&body)?;
        Ok(body)
    }

    /// GET with retries. `None` once attempts are exhausted or the failure
    /// is permanent.
    async fn fetch(&self, query: &[(&str, String)]) -> Option<serde_json::Value> {
        let url = match self.endpoint(query) {
            Ok(url) => url,
            Err(e) => {
                warn!("[{}] Cannot build request URL: {}", self.adapter.name(), e);
                return None;
            }
        };

        let mut attempt = 1;
        loop {
            debug!("[{}] GET {} (attempt {})", self.adapter.name(), url, attempt);
            match self.fetch_once(&url).await {
                Ok(body) => return Some(body),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "[{}] {} – retrying in {:?}",
                        self.adapter.name(),
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        "[{}] Giving up on {} after {} attempt(s): {}",
                        self.adapter.name(),
                        url,
                        attempt,
                        e
                    );
                    return None;
                }
            }
        }
    }
}

/// API-Sports answers 200 with a non-empty `errors` field on quota problems.
fn check_body_errors(body: &serde_json::Value) -> Result<(), VendorError> {
    let errors = match body.get("errors") {
        Some(serde_json::Value::Object(map)) if !map.is_empty() => body["errors"].to_string(),
        Some(serde_json::Value::Array(items)) if !items.is_empty() => body["errors"].to_string(),
        _ => return Ok(()),
    };
    let lower = errors.to_lowercase();
    if lower.contains("ratelimit") || lower.contains("rate limit") || lower.contains("too many") {
        Err(VendorError::RateLimited)
    } else {
        Err(VendorError::Api(errors))
    }
}

#[async_trait]
impl<A: VendorAdapter> MatchSource for ApiSportsClient<A> {
    fn name(&self) -> &str {
        self.adapter.name()
    }

    fn sport(&self) -> Sport {
        self.adapter.sport()
    }

    async fn get_live_matches(&self) -> Vec<ExternalMatch> {
        if self.adapter.supports_live_filter() {
            return self
                .fetch(&[("live", "all".to_string())])
                .await
                .map(|body| self.adapter.normalize(&body))
                .unwrap_or_default();
        }
        // No live filter: scan today's schedule for games in play.
        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        self.fetch(&[("date", today)])
            .await
            .map(|body| self.adapter.normalize(&body))
            .unwrap_or_default()
            .into_iter()
            .filter(|m| m.phase.is_in_progress())
            .collect()
    }

    async fn get_matches_by_date_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<ExternalMatch> {
        let mut out = Vec::new();
        let mut day = start;
        let mut fetched = 0;
        while day <= end && fetched < MAX_RANGE_DAYS {
            let query = [("date", day.format("%Y-%m-%d").to_string())];
            if let Some(body) = self.fetch(&query).await {
                out.extend(self.adapter.normalize(&body));
            }
            fetched += 1;
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        out
    }

    async fn get_match_by_id(&self, id: &str) -> Option<ExternalMatch> {
        let body = self.fetch(&[("id", id.to_string())]).await?;
        self.adapter
            .normalize(&body)
            .into_iter()
            .find(|m| m.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live_scores::{FootballAdapter, RugbyAdapter};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    /// Serve the given (status line, body) responses, one per connection.
    async fn serve(responses: Vec<(&'static str, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = sock.write_all(resp.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let d1 = policy.delay_for(1);
        assert!(d1 >= Duration::from_millis(100) && d1 <= Duration::from_millis(150));
        let d2 = policy.delay_for(2);
        assert!(d2 >= Duration::from_millis(200) && d2 <= Duration::from_millis(250));
        let d5 = policy.delay_for(5);
        assert!(d5 <= Duration::from_millis(350));
    }

    #[test]
    fn test_body_errors_classified() {
        let quota = serde_json::json!({"errors": {"rateLimit": "Too many requests"}});
        assert!(matches!(check_body_errors(&quota), Err(VendorError::RateLimited)));
        let token = serde_json::json!({"errors": {"token": "Error/Missing application key"}});
        assert!(matches!(check_body_errors(&token), Err(VendorError::Api(_))));
        let fine = serde_json::json!({"errors": [], "response": []});
        assert!(check_body_errors(&fine).is_ok());
        assert!(!VendorError::Api("x".into()).is_retryable());
        assert!(VendorError::Status(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(!VendorError::Status(StatusCode::NOT_FOUND).is_retryable());
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let client = ApiSportsClient::new(
            RugbyAdapter::new(),
            "http://localhost:9000/proxy",
            None,
            Duration::from_secs(1),
            RetryPolicy::default(),
        )
        .unwrap();
        let url = client.endpoint(&[("date", "2024-05-12".into())]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/proxy/games?date=2024-05-12");
    }

    #[tokio::test]
    async fn test_get_match_by_id_after_transient_failure() {
        let body = serde_json::json!({"errors": [], "response": [{
            "fixture": {"id": 42, "timestamp": 1715536800, "status": {"short": "FT", "elapsed": 90}},
            "league": {"name": "Primeira Liga"},
            "teams": {"home": {"name": "FC Porto"}, "away": {"name": "Sporting CP"}},
            "goals": {"home": 2, "away": 1}
        }]})
        .to_string();
        let base = serve(vec![
            ("503 Service Unavailable", "{}".to_string()),
            ("200 OK", body),
        ])
        .await;
        let client = ApiSportsClient::new(
            FootballAdapter::new(),
            &base,
            Some("key".into()),
            Duration::from_secs(2),
            fast_retry(3),
        )
        .unwrap();
        let m = client.get_match_by_id("42").await.unwrap();
        assert_eq!(m.home_team, "FC Porto");
        assert_eq!(m.authoritative_score().unwrap().home, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_yield_empty() {
        let base = serve(vec![
            ("429 Too Many Requests", "{}".to_string()),
            ("429 Too Many Requests", "{}".to_string()),
        ])
        .await;
        let client = ApiSportsClient::new(
            FootballAdapter::new(),
            &base,
            None,
            Duration::from_secs(2),
            fast_retry(2),
        )
        .unwrap();
        assert!(client.get_live_matches().await.is_empty());
    }
}
