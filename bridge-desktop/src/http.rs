//! Media fetcher implementation using Reqwest

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, NetworkError, NetworkResult},
    http::MediaFetcher,
};
use bytes::Bytes;
use core_runtime::logging::redact_url;
use futures_util::StreamExt;
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const USER_AGENT: &str = concat!("usdb-sync/", env!("CARGO_PKG_VERSION"));

/// Reqwest-based media fetcher
///
/// Provides:
/// - Connection pooling via reqwest
/// - Status classification into retryable/non-retryable [`NetworkError`]s
/// - Streaming downloads straight to disk
///
/// Retries are not performed here; the sync engine owns the retry loop.
pub struct ReqwestMediaFetcher {
    client: Client,
}

impl ReqwestMediaFetcher {
    /// Create a fetcher with a 30 second per-request timeout
    pub fn new() -> Result<Self, BridgeError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create a fetcher with a custom per-request timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self, BridgeError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| BridgeError::OperationFailed(format!("HTTP client setup: {e}")))?;

        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Media URLs may carry session tokens, so the URL is dropped from the error.
    fn classify(error: reqwest::Error) -> NetworkError {
        let error = error.without_url();
        if let Some(status) = error.status() {
            NetworkError::from_status(status.as_u16(), error.to_string())
        } else if error.is_timeout() {
            NetworkError::new(None, true, "Request timed out")
        } else if error.is_connect() {
            NetworkError::transport(format!("Connection failed: {error}"))
        } else if error.is_builder() {
            // Unparsable URL and friends; another attempt won't help.
            NetworkError::new(None, false, error.to_string())
        } else {
            NetworkError::transport(error.to_string())
        }
    }

    async fn get(&self, url: &str) -> NetworkResult<reqwest::Response> {
        debug!(url = %redact_url(url), "Fetching media");

        let response = self.client.get(url).send().await.map_err(Self::classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::from_status(
                status.as_u16(),
                format!("GET {} returned {status}", redact_url(url)),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl MediaFetcher for ReqwestMediaFetcher {
    async fn fetch(&self, url: &str) -> NetworkResult<Bytes> {
        let response = self.get(url).await?;
        response.bytes().await.map_err(Self::classify)
    }

    async fn fetch_to_path(&self, url: &str, dest: &Path) -> NetworkResult<u64> {
        let response = self.get(url).await?;

        let write_error = |e: std::io::Error| {
            NetworkError::new(None, false, format!("write {}: {e}", dest.display()))
        };

        let mut file = tokio::fs::File::create(dest).await.map_err(write_error)?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Self::classify)?;
            file.write_all(&chunk).await.map_err(write_error)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(write_error)?;

        debug!(url = %redact_url(url), bytes = written, "Media stored");
        Ok(written)
    }
}
