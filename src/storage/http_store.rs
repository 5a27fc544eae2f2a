//! HTTP object-store client.
//!
//! Objects are addressed as `{endpoint}/{bucket}/{key}`: `GET` downloads,
//! `PUT` uploads. Transient failures (connection errors, 429 and 5xx) are
//! retried with exponential backoff; other statuses fail immediately.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::ObjectStore;
use crate::error::StorageError;

/// Retry policy for object-store requests.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

enum Attempt<T> {
    Done(T),
    Retry(String),
}

/// Object-store client over plain HTTP.
pub struct HttpObjectStore {
    client: Client,
    endpoint: String,
    token: Option<String>,
    retry: RetryPolicy,
}

impl HttpObjectStore {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| StorageError::Request {
                bucket: String::new(),
                key: String::new(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, bucket, key.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn is_transient(status: StatusCode) -> bool {
        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
    }

    async fn fetch_once(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
    ) -> Result<Attempt<u64>, StorageError> {
        let url = self.url(bucket, key);
        let mut response = match self.request(reqwest::Method::GET, &url).send().await {
            Ok(response) => response,
            Err(e) => return Ok(Attempt::Retry(e.to_string())),
        };

        let status = response.status();
        if Self::is_transient(status) {
            return Ok(Attempt::Retry(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(StorageError::Status {
                status: status.as_u16(),
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
                Ok(None) => break,
                Err(e) => return Ok(Attempt::Retry(e.to_string())),
            }
        }
        file.flush().await?;

        Ok(Attempt::Done(written))
    }

    async fn put_once(
        &self,
        body: Vec<u8>,
        bucket: &str,
        key: &str,
    ) -> Result<Attempt<()>, StorageError> {
        let url = self.url(bucket, key);
        let response = match self
            .request(reqwest::Method::PUT, &url)
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Ok(Attempt::Retry(e.to_string())),
        };

        let status = response.status();
        if status.is_success() {
            Ok(Attempt::Done(()))
        } else if Self::is_transient(status) {
            Ok(Attempt::Retry(format!("HTTP {}", status)))
        } else {
            Err(StorageError::Status {
                status: status.as_u16(),
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
        }
    }

    async fn give_up_or_wait(
        &self,
        attempt: u32,
        bucket: &str,
        key: &str,
        reason: String,
    ) -> Result<(), StorageError> {
        if attempt >= self.retry.max_attempts {
            return Err(StorageError::Request {
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: format!("{} (after {} attempts)", reason, attempt),
            });
        }
        let delay = self.retry.backoff(attempt);
        warn!(bucket, key, attempt, reason = %reason, delay_ms = delay.as_millis() as u64, "Retrying object store request");
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64, StorageError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_once(bucket, key, dest).await? {
                Attempt::Done(bytes) => {
                    debug!(bucket, key, bytes, "Fetched object");
                    return Ok(bytes);
                }
                Attempt::Retry(reason) => {
                    self.give_up_or_wait(attempt, bucket, key, reason).await?
                }
            }
        }
    }

    async fn put(&self, src: &Path, bucket: &str, key: &str) -> Result<(), StorageError> {
        let body = tokio::fs::read(src).await?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.put_once(body.clone(), bucket, key).await? {
                Attempt::Done(()) => {
                    debug!(bucket, key, bytes = body.len(), "Uploaded object");
                    return Ok(());
                }
                Attempt::Retry(reason) => {
                    self.give_up_or_wait(attempt, bucket, key, reason).await?
                }
            }
        }
    }
}
