//! Durable state (watermarks, record sinks) and the rate-limited upstream HTTP client.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub mod sink;
pub mod watermark;

pub use sink::{InMemorySink, OpeningResultSink, NoticeSink, PgSink, PrepPriceSink};
pub use watermark::{InMemoryWatermarkStore, PgWatermarkStore, WatermarkStore};

pub const CRATE_NAME: &str = "bidfill-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("stored value out of range: {0}")]
    OutOfRange(String),
}

pub async fn connect_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("running migrations")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Capped exponential backoff: `min(max_delay, base_delay * 2^attempt)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl RateLimitConfig {
    /// Roughly `tps` requests per second with a burst of the same size.
    pub fn per_second(tps: u32) -> Self {
        let tps = tps.max(1);
        Self {
            capacity: tps,
            refill_every: Duration::from_secs(1) / tps,
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

#[derive(Debug, Clone, Copy)]
struct LimiterState {
    tokens: u32,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until a request slot is available and consumes it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let period = self.config.refill_every.as_nanos().max(1);
                let earned = state.last_refill.elapsed().as_nanos() / period;
                if earned > 0 {
                    let earned = u32::try_from(earned).unwrap_or(u32::MAX);
                    state.tokens = state.tokens.saturating_add(earned).min(self.config.capacity);
                    state.last_refill = Instant::now();
                }
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                self.config.refill_every
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            rate_limit: Some(RateLimitConfig::per_second(8)),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable body from {operation}: {message}")]
    Decode { operation: String, message: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::Retryable),
            // Rate-limited gateways answer with XML or HTML error pages.
            Self::Decode { .. } => RetryDisposition::Retryable,
        }
    }
}

/// Service keys are often issued pre-encoded; the query builder re-encodes them.
pub fn normalize_service_key(key: &str) -> String {
    let key = key.trim();
    if key.contains('%') {
        urlencoding::decode(key)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| key.to_string())
    } else {
        key.to_string()
    }
}

/// Single-shot JSON client for one upstream OpenAPI service; retries belong to the caller.
#[derive(Debug)]
pub struct OpenApiClient {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
    limiter: Option<Arc<RateLimiter>>,
}

impl OpenApiClient {
    pub fn new(
        base_url: impl Into<String>,
        service_key: &str,
        config: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: normalize_service_key(service_key),
            limiter: config.rate_limit.map(|c| Arc::new(RateLimiter::new(c))),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn operation_url(&self, operation: &str) -> String {
        format!("{}/{}", self.base_url, operation)
    }

    pub async fn get_json(
        &self,
        operation: &str,
        params: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let url = self.operation_url(operation);
        let span = info_span!("openapi_get", operation);
        async {
            let resp = self
                .client
                .get(&url)
                .query(&[("ServiceKey", self.service_key.as_str()), ("type", "json")])
                .query(params)
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: url.clone(),
                });
            }

            let body = resp.bytes().await?;
            debug!(bytes = body.len(), "upstream response received");
            serde_json::from_slice(&body).map_err(|err| FetchError::Decode {
                operation: operation.to_string(),
                message: err.to_string(),
            })
        }
        .instrument(span)
        .await
    }
}
