// src/ingest/http.rs
//! Shared upstream HTTP plumbing: one retrying client for every adapter,
//! plus the per-source last-known-good snapshot cache on disk.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::counter;
use reqwest::StatusCode;
use tokio::fs;

use crate::ingest::types::Source;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx and rate limits are worth another try; 4xx means the request itself
/// is wrong and retrying cannot help.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_request_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Retrying HTTP client shared by all adapters. Side-effect-free except for
/// the cache directory it reads/writes snapshots in.
pub struct SourceClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    cache_dir: PathBuf,
}

impl SourceClient {
    pub fn new(timeout: Duration, cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("recall-sentinel/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            backoff: BackoffPolicy::default(),
            cache_dir: cache_dir.into(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    async fn get_with_retry(&self, source: Source, url: &str) -> Result<reqwest::Response> {
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt - 1)).await;
            }
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let err = anyhow::anyhow!("http status {status} for {url}");
                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(err);
                    }
                    tracing::debug!(source = %source, %url, %status, attempt, "retryable status");
                    last_err = Some(err);
                }
                Err(e) => {
                    let disposition = classify_request_error(&e);
                    tracing::debug!(source = %source, %url, error = ?e, attempt, "request error");
                    if disposition == RetryDisposition::NonRetryable {
                        return Err(e).context(format!("requesting {url}"));
                    }
                    last_err = Some(anyhow::Error::new(e).context(format!("requesting {url}")));
                }
            }
            counter!("ingest_http_retries_total", "source" => source.as_str()).increment(1);
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("request to {url} failed")))
    }

    pub async fn get_json(&self, source: Source, url: &str) -> Result<serde_json::Value> {
        let resp = self.get_with_retry(source, url).await?;
        resp.json::<serde_json::Value>()
            .await
            .with_context(|| format!("decoding json body from {url}"))
    }

    pub async fn get_text(&self, source: Source, url: &str) -> Result<String> {
        let resp = self.get_with_retry(source, url).await?;
        resp.text()
            .await
            .with_context(|| format!("reading body from {url}"))
    }

    fn snapshot_path(&self, source: Source) -> PathBuf {
        self.cache_dir.join(format!("{source}.json"))
    }

    /// Persist the last successful upstream payload; read back by
    /// `read_snapshot` when every live attempt is exhausted.
    pub async fn write_snapshot(&self, source: Source, payload: &serde_json::Value) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)
            .await
            .with_context(|| format!("creating cache dir {}", self.cache_dir.display()))?;
        let path = self.snapshot_path(source);
        let bytes = serde_json::to_vec(payload).context("serializing snapshot")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing snapshot {}", path.display()))?;
        Ok(())
    }

    pub async fn read_snapshot(&self, source: Source) -> Result<serde_json::Value> {
        let path = self.snapshot_path(source);
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing snapshot {}", path.display()))
    }
}
