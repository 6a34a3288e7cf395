//! # Polite Catalog Fetcher
//!
//! Issues catalog GET requests the way a cautious browser would: a random
//! pause before every attempt, a fresh User-Agent per attempt, and exponential
//! backoff with jitter between retries. All retrying happens here; the
//! underlying reqwest client is built without any retry layer of its own.
//!
//! ## Outcomes
//!
//! - [`FetchOutcome::Ok`]: a 2xx response that is not a challenge page
//! - [`FetchOutcome::BotWall`]: a CAPTCHA/robot-check page. Returned on the
//!   attempt that saw it; never retried
//! - [`FetchOutcome::HttpError`]: a status ≥ 400 that was terminal or
//!   outlived the retry budget
//! - [`FetchOutcome::NetworkError`]: connection or timeout failure after the
//!   retry budget
//!
//! The fetcher knows nothing about page semantics.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rand::seq::SliceRandom;
use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Settings;

/// Static identity pool; one is picked per attempt.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_3) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.3 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:123.0) Gecko/20100101 Firefox/123.0",
];

/// Lower-case phrases that only appear on challenge pages.
const BOT_WALL_MARKERS: &[&str] = &[
    "enter the characters you see below",
    "type the characters you see in this image",
    "sorry, we just need to make sure you're not a robot",
    "/errors/validatecaptcha",
    "automated access to amazon data",
];

pub fn is_bot_wall(body: &str) -> bool {
    let lower = body.to_lowercase();
    BOT_WALL_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Ok(String),
    BotWall,
    HttpError(u16),
    NetworkError(String),
}

impl FetchOutcome {
    pub fn html(&self) -> Option<&str> {
        match self {
            Self::Ok(html) => Some(html),
            _ => None,
        }
    }
}

/// Connection-level failure, as opposed to an HTTP status.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Connection(err.to_string())
        }
    }
}

/// Status and body of one HTTP exchange
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// A single GET, with no retries. Implemented over reqwest in production and
/// by scripted fakes in tests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str, user_agent: &str) -> Result<RawResponse, TransportError>;
}

/// Pooled reqwest client sending browser-like headers
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-IN,en;q=0.9"));
        headers.insert("Upgrade-Insecure-Requests", HeaderValue::from_static("1"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, user_agent: &str) -> Result<RawResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, user_agent)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(RawResponse { status, body })
    }
}

/// Attempt ceiling, pacing and backoff for catalog requests
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.max_request_attempts.max(1),
            min_delay: settings.min_sleep,
            max_delay: settings.max_sleep,
            backoff_base: settings.backoff_base,
            backoff_max: settings.backoff_max,
        }
    }

    /// Statuses worth another attempt: timeouts, throttling and server errors.
    pub fn is_retryable_status(status: u16) -> bool {
        matches!(status, 408 | 429) || (500..600).contains(&status)
    }

    /// Wait before attempt `attempt + 1`, given `jitter` in `[0, 1)`.
    pub fn backoff_delay(&self, attempt: u32, jitter: f64) -> Duration {
        let base = self.backoff_base.as_secs_f64();
        let exponent = attempt.saturating_sub(1).min(16);
        let exponential = base * f64::from(1u32 << exponent);
        let delay = (exponential + base * jitter.clamp(0.0, 1.0)).min(self.backoff_max.as_secs_f64());
        Duration::from_secs_f64(delay.max(0.0))
    }

    fn politeness_delay(&self) -> Duration {
        if self.max_delay <= self.min_delay {
            return self.min_delay;
        }
        let secs = rand::thread_rng()
            .gen_range(self.min_delay.as_secs_f64()..=self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(settings.request_timeout)?;
        Ok(Self::with_transport(
            Arc::new(transport),
            RetryPolicy::from_settings(settings),
        ))
    }

    pub fn with_transport(transport: Arc<dyn HttpTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn fetch(&self, url: &str) -> FetchOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last = FetchOutcome::NetworkError("no attempt made".to_string());

        for attempt in 1..=max_attempts {
            tokio::time::sleep(self.policy.politeness_delay()).await;

            let user_agent = USER_AGENTS
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or(USER_AGENTS[0]);

            debug!("GET {} (attempt {}/{})", url, attempt, max_attempts);

            match self.transport.get(url, user_agent).await {
                Ok(response) => {
                    if is_bot_wall(&response.body) {
                        warn!("Bot wall detected at {} (status {})", url, response.status);
                        return FetchOutcome::BotWall;
                    }
                    if (200..300).contains(&response.status) {
                        return FetchOutcome::Ok(response.body);
                    }

                    warn!(
                        "HTTP {} from {} (attempt {}/{})",
                        response.status, url, attempt, max_attempts
                    );
                    last = FetchOutcome::HttpError(response.status);
                    if !RetryPolicy::is_retryable_status(response.status) {
                        return last;
                    }
                }
                Err(err) => {
                    warn!(
                        "Request to {} failed: {} (attempt {}/{})",
                        url, err, attempt, max_attempts
                    );
                    last = FetchOutcome::NetworkError(err.to_string());
                }
            }

            if attempt < max_attempts {
                let jitter = rand::thread_rng().gen_range(0.0..1.0);
                tokio::time::sleep(self.policy.backoff_delay(attempt, jitter)).await;
            }
        }

        last
    }
}
