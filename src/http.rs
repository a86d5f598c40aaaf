//! Shared HTTP client with retry, exponential backoff and jitter.
//!
//! Every node-to-node call (store client, message transport) goes through
//! here so they all back off the same way.

use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;

use crate::error::{ClusterError, ErrorResponse, Result};

const INITIAL_BACKOFF_MS: u64 = 150;
const MAX_BACKOFF_MS: u64 = 1200;

#[derive(Clone)]
pub struct RetryingClient {
    http_client: reqwest::Client,
    timeout: Duration,
}

impl RetryingClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            timeout,
        }
    }

    /// POSTs `payload` as JSON and decodes a JSON reply.
    ///
    /// Only connection-level errors are retried; an HTTP error status is
    /// returned as is.
    pub async fn post_json<T, R>(&self, url: &str, payload: &T, attempts: usize) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.post_with_retry(url, payload, attempts).await?;
        decode(url, response).await
    }

    /// GETs `url`; a 404 becomes `Ok(None)`.
    pub async fn get_json<R>(&self, url: &str, attempts: usize) -> Result<Option<R>>
    where
        R: DeserializeOwned,
    {
        let response = self.get_with_retry(url, attempts).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(url, response).await.map(Some)
    }

    async fn post_with_retry<T: Serialize + ?Sized>(
        &self,
        url: &str,
        payload: &T,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = INITIAL_BACKOFF_MS;
        let attempts = attempts.max(1);

        for attempt in 0..attempts {
            let response = self
                .http_client
                .post(url)
                .json(payload)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(ClusterError::Messaging(format!("POST {}: {}", url, e)));
                    }
                    tracing::debug!("POST {} failed (attempt {}): {}", url, attempt + 1, e);
                    delay_ms = backoff(delay_ms).await;
                }
            }
        }

        Err(ClusterError::Messaging("Retry attempts exhausted".to_string()))
    }

    async fn get_with_retry(&self, url: &str, attempts: usize) -> Result<reqwest::Response> {
        let mut delay_ms = INITIAL_BACKOFF_MS;
        let attempts = attempts.max(1);

        for attempt in 0..attempts {
            let response = self
                .http_client
                .get(url)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(ClusterError::Messaging(format!("GET {}: {}", url, e)));
                    }
                    delay_ms = backoff(delay_ms).await;
                }
            }
        }

        Err(ClusterError::Messaging("Retry attempts exhausted".to_string()))
    }
}

/// Sleeps for `delay_ms` plus jitter and returns the next delay.
async fn backoff(delay_ms: u64) -> u64 {
    let jitter = rand::random::<u64>() % 50;
    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
    (delay_ms * 2).min(MAX_BACKOFF_MS)
}

async fn decode<R: DeserializeOwned>(url: &str, response: reqwest::Response) -> Result<R> {
    let status = response.status();
    if !status.is_success() {
        let detail = match response.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        return Err(ClusterError::Messaging(format!("{} returned {}: {}", url, status, detail)));
    }
    response
        .json::<R>()
        .await
        .map_err(|e| ClusterError::Serialization(format!("{}: {}", url, e)))
}
