use std::time::Duration;

use rand::Rng as _;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::FetchError;
use crate::page::{self, UnitPage};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0 Safari/537.36 serialbook/0.1";

const HTML_ACCEPT: &str = "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8";

/// Network policy. Every delay here is configuration, not protocol.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Attempt ceiling per request, first try included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Minimum gap between successive unit fetches. Retries are paced by
    /// the backoff instead.
    pub min_delay: Duration,
    pub jitter: Duration,
    pub timeout: Duration,
    /// Stop the walk after this many units failed in one run.
    pub max_unit_failures: usize,
    pub max_units: Option<usize>,
    pub user_agent: String,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            min_delay: Duration::from_millis(1500),
            jitter: Duration::from_millis(2000),
            timeout: Duration::from_secs(15),
            max_unit_failures: 5,
            max_units: None,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl FetchPolicy {
    /// Zero delays and jitter; used by tests and local mirrors.
    pub fn immediate() -> Self {
        Self {
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
            min_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// `base * 2^retry`, raised to `retry_after` when the server asked for
    /// more, capped at `backoff_max`, plus jitter.
    pub fn backoff_delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let exponential = self
            .backoff_base
            .saturating_mul(2_u32.saturating_pow(retry));
        let delay = exponential
            .max(retry_after.unwrap_or_default())
            .min(self.backoff_max);
        delay.saturating_add(random_jitter(self.jitter))
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: Url,
    pub html: String,
}

#[derive(Debug, Clone)]
pub struct FetchedUnit {
    pub final_url: Url,
    pub html: String,
    pub page: UnitPage,
}

/// Sequential HTTP client for one series. Holds the pacing clock, so a
/// single engine must be used for all unit fetches of a walk.
pub struct FetchEngine {
    client: reqwest::Client,
    policy: FetchPolicy,
    cancel: CancellationToken,
    last_unit_fetch: Option<Instant>,
}

impl FetchEngine {
    pub fn new(policy: FetchPolicy, cancel: CancellationToken) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(policy.timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|err| anyhow::anyhow!("build http client: {err}"))?;
        Ok(Self {
            client,
            policy,
            cancel,
            last_unit_fetch: None,
        })
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Fetches one unit page: waits out the inter-unit delay, retries
    /// transient failures, and rejects pages without a content container.
    pub async fn fetch_unit(&mut self, url: &Url) -> Result<FetchedUnit, FetchError> {
        self.pace(url).await?;
        let result = self.fetch_page(url).await;
        self.last_unit_fetch = Some(Instant::now());
        let fetched = result?;

        let page = page::parse_unit(&fetched.final_url, &fetched.html);
        if !page.has_content {
            return Err(FetchError::Permanent {
                url: url.to_string(),
                reason: "page has no unit content container".to_owned(),
                next_url: page.next_url.map(|next| next.to_string()),
            });
        }
        Ok(FetchedUnit {
            final_url: fetched.final_url,
            html: fetched.html,
            page,
        })
    }

    /// Fetches an HTML page with retries but without inter-unit pacing.
    pub async fn fetch_page(&self, url: &Url) -> Result<FetchedPage, FetchError> {
        let (final_url, bytes) = self.fetch_with_retries(url, true).await?;
        let html = String::from_utf8_lossy(&bytes).into_owned();
        if !looks_like_html(&html) {
            return Err(FetchError::Permanent {
                url: url.to_string(),
                reason: "response body is not HTML".to_owned(),
                next_url: None,
            });
        }
        Ok(FetchedPage { final_url, html })
    }

    /// Fetches a binary resource such as a cover image.
    pub async fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let (_, bytes) = self.fetch_with_retries(url, false).await?;
        Ok(bytes)
    }

    async fn pace(&self, url: &Url) -> Result<(), FetchError> {
        let Some(last) = self.last_unit_fetch else {
            return Ok(());
        };
        let wanted = self
            .policy
            .min_delay
            .saturating_add(random_jitter(self.policy.jitter));
        let elapsed = last.elapsed();
        if elapsed >= wanted {
            return Ok(());
        }
        let wait = wanted - elapsed;
        tracing::debug!(%url, delay_ms = wait.as_millis() as u64, "pacing before next unit");
        self.sleep_or_cancel(url, wait).await
    }

    async fn sleep_or_cancel(&self, url: &Url, delay: Duration) -> Result<(), FetchError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled { url: url.to_string() }),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn fetch_with_retries(
        &self,
        url: &Url,
        expect_html: bool,
    ) -> Result<(Url, Vec<u8>), FetchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled {
                    url: url.to_string(),
                });
            }
            match self.fetch_once(url, expect_html).await {
                Ok(fetched) => return Ok(fetched),
                Err(FetchError::Transient {
                    url: failed_url,
                    reason,
                    retry_after,
                }) if attempt < max_attempts => {
                    let delay = self.policy.backoff_delay(attempt - 1, retry_after);
                    tracing::warn!(
                        url = %failed_url,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "transient fetch failure; retrying"
                    );
                    self.sleep_or_cancel(url, delay).await?;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::debug!(%url, attempt, ?err, "fetch failed");
                    return Err(err);
                }
            }
        }
    }

    async fn fetch_once(&self, url: &Url, expect_html: bool) -> Result<(Url, Vec<u8>), FetchError> {
        let accept = if expect_html { HTML_ACCEPT } else { "*/*" };
        let response = self
            .client
            .get(url.clone())
            .header(USER_AGENT, &self.policy.user_agent)
            .header(ACCEPT, accept)
            .send()
            .await
            .map_err(|err| FetchError::Transient {
                url: url.to_string(),
                reason: describe_reqwest_error(&err),
                retry_after: None,
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_from(response.headers());
            return Err(classify_status(url, status, retry_after));
        }

        if expect_html
            && let Some(content_type) = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
        {
            let content_type = content_type.to_ascii_lowercase();
            if !(content_type.starts_with("text/html")
                || content_type.starts_with("application/xhtml+xml"))
            {
                return Err(FetchError::Permanent {
                    url: url.to_string(),
                    reason: format!("unexpected content type: {content_type}"),
                    next_url: None,
                });
            }
        }

        let final_url = response.url().clone();
        let bytes = response.bytes().await.map_err(|err| FetchError::Transient {
            url: url.to_string(),
            reason: format!("read body: {}", describe_reqwest_error(&err)),
            retry_after: None,
        })?;
        Ok((final_url, bytes.to_vec()))
    }
}

/// 408, 429 and 5xx are worth another try; every other 4xx is final.
pub fn classify_status(url: &Url, status: StatusCode, retry_after: Option<Duration>) -> FetchError {
    let transient = status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error();
    if transient {
        FetchError::Transient {
            url: url.to_string(),
            reason: format!("HTTP {status}"),
            retry_after,
        }
    } else {
        FetchError::Permanent {
            url: url.to_string(),
            reason: format!("HTTP {status}"),
            next_url: None,
        }
    }
}

fn retry_after_from(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn describe_reqwest_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "timed out".to_owned()
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    }
}

pub fn looks_like_html(body: &str) -> bool {
    if body.trim().is_empty() {
        return false;
    }
    let head: String = body.trim_start().chars().take(2048).collect();
    let head = head.to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.contains("<html") || head.contains("<body")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64) -> FetchPolicy {
        FetchPolicy {
            backoff_base: Duration::from_millis(base_ms),
            backoff_max: Duration::from_millis(max_ms),
            jitter: Duration::ZERO,
            ..FetchPolicy::default()
        }
    }

    #[test]
    fn backoff_doubles_per_retry_and_is_capped() {
        let policy = policy(100, 1000);
        assert_eq!(policy.backoff_delay(0, None), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1, None), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3, None), Duration::from_millis(800));
        assert_eq!(policy.backoff_delay(4, None), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(40, None), Duration::from_millis(1000));
    }

    #[test]
    fn retry_after_raises_delay_up_to_cap() {
        let policy = policy(100, 5000);
        assert_eq!(
            policy.backoff_delay(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.backoff_delay(0, Some(Duration::from_secs(60))),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = FetchPolicy {
            jitter: Duration::from_millis(50),
            ..policy(10, 10)
        };
        for _ in 0..100 {
            let delay = policy.backoff_delay(0, None);
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(60));
        }
    }

    #[test]
    fn status_classification() {
        let url = Url::parse("https://example.com/chapter/1").expect("url");
        for code in [408, 429, 500, 502, 503] {
            let status = StatusCode::from_u16(code).expect("status");
            assert!(classify_status(&url, status, None).is_transient(), "{code}");
        }
        for code in [400, 401, 403, 404, 410] {
            let status = StatusCode::from_u16(code).expect("status");
            assert!(!classify_status(&url, status, None).is_transient(), "{code}");
        }
    }

    #[test]
    fn html_sniffing() {
        assert!(looks_like_html("<!DOCTYPE html><html></html>"));
        assert!(looks_like_html("  <html><body>x</body></html>"));
        assert!(!looks_like_html("{\"json\": true}"));
        assert!(!looks_like_html("   "));
    }
}
