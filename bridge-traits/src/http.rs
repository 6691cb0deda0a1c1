//! Media Download Abstraction
//!
//! Fetches the raw bytes behind a media URL. Resolution of the URL itself
//! (scraping, video site extraction) happens before the engine sees it.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

use crate::error::NetworkResult;

/// Media-fetch collaborator.
///
/// Implementations decide whether a failure is retryable; the caller owns the
/// retry loop and the timeout.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Download the resource into memory.
    async fn fetch(&self, url: &str) -> NetworkResult<Bytes>;

    /// Stream the resource to `dest`, returning the number of bytes written.
    ///
    /// The default buffers through [`fetch`](Self::fetch); adapters that can
    /// stream should override it.
    async fn fetch_to_path(&self, url: &str, dest: &Path) -> NetworkResult<u64> {
        let bytes = self.fetch(url).await?;
        tokio::fs::write(dest, &bytes).await.map_err(|e| {
            crate::error::NetworkError::new(None, false, format!("write {}: {}", dest.display(), e))
        })?;
        Ok(bytes.len() as u64)
    }
}
