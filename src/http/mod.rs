use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::HttpSettings;

const MAX_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempts: {source}")]
    Transport {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} still returned {status} after {attempts} attempts")]
    Exhausted {
        url: String,
        status: StatusCode,
        attempts: u32,
    },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub retry_statuses: Vec<StatusCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            backoff_base: Duration::from_millis(500),
            retry_statuses: vec![
                StatusCode::REQUEST_TIMEOUT,
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::INTERNAL_SERVER_ERROR,
                StatusCode::BAD_GATEWAY,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::GATEWAY_TIMEOUT,
            ],
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &HttpSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff_base: settings.backoff_base,
            ..Self::default()
        }
    }

    pub fn should_retry(&self, status: StatusCode) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Exponential delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.backoff_base.saturating_mul(factor)
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let jitter_ms = rand::thread_rng().gen_range(0..=250u64);
        self.base_delay(attempt) + Duration::from_millis(jitter_ms)
    }
}

/// One pooled client shared by every request against a store.
#[derive(Clone, Debug)]
pub struct HttpSession {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpSession {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("es-AR,es;q=0.9"));

        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(settings.user_agent.clone())
            .default_headers(headers)
            .cookie_store(true)
            .use_rustls_tls()
            .build()
            .context("Unable to construct reqwest client")?;

        Ok(Self {
            client,
            policy: RetryPolicy::from_settings(settings),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// GET with retries on transport errors and retryable statuses. Any other
    /// status is handed back to the caller untouched.
    pub async fn get(&self, url: &str, query: &[(String, String)]) -> Result<Response, FetchError> {
        let mut attempt = 0;
        loop {
            let outcome = self.client.get(url).query(query).send().await;

            match outcome {
                Ok(resp) if self.policy.should_retry(resp.status()) => {
                    let status = resp.status();
                    if attempt >= self.policy.max_retries {
                        return Err(FetchError::Exhausted {
                            url: url.to_string(),
                            status,
                            attempts: attempt + 1,
                        });
                    }
                    let delay = retry_after(&resp)
                        .unwrap_or_else(|| self.policy.delay_with_jitter(attempt));
                    warn!(
                        "{} answered {} (attempt {}/{}), retrying in {:?}",
                        url,
                        status,
                        attempt + 1,
                        self.policy.max_retries + 1,
                        delay
                    );
                    sleep(delay).await;
                }
                Ok(resp) => {
                    debug!("GET {} -> {}", resp.url(), resp.status());
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt >= self.policy.max_retries {
                        return Err(FetchError::Transport {
                            url: url.to_string(),
                            attempts: attempt + 1,
                            source: err,
                        });
                    }
                    let delay = self.policy.delay_with_jitter(attempt);
                    warn!(
                        "GET {} failed (attempt {}/{}): {}, retrying in {:?}",
                        url,
                        attempt + 1,
                        self.policy.max_retries + 1,
                        err,
                        delay
                    );
                    sleep(delay).await;
                }
            }
            attempt += 1;
        }
    }
}

fn retry_after(resp: &Response) -> Option<Duration> {
    if resp.status() != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }
    resp.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs.min(MAX_RETRY_AFTER_SECS)))
}
