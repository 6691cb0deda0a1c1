//! Remote catalog interface
//!
//! The scraping client that turns USDB pages into records lives outside the
//! engine. It is reached through [`CatalogSource`]; everything the engine
//! knows about the remote side is a [`RemoteSongRecord`].

use async_trait::async_trait;
use bytes::Bytes;
use core_library::{AssetKind, SongId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Remote view of one song, immutable for the duration of a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSongRecord {
    pub id: SongId,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub edition: Option<String>,
    /// Hash of the notes/metadata payload; changes whenever the notes change
    pub content_hash: String,
    /// Media source per asset kind. Notes are fetched through the catalog.
    #[serde(default)]
    pub media_urls: BTreeMap<AssetKind, String>,
}

impl RemoteSongRecord {
    pub fn new(
        id: SongId,
        artist: impl Into<String>,
        title: impl Into<String>,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            artist: artist.into(),
            edition: None,
            content_hash: content_hash.into(),
            media_urls: BTreeMap::new(),
        }
    }

    pub fn with_url(mut self, kind: AssetKind, url: impl Into<String>) -> Self {
        self.media_urls.insert(kind, url.into());
        self
    }

    pub fn url(&self, kind: AssetKind) -> Option<&str> {
        self.media_urls.get(&kind).map(String::as_str)
    }
}

/// The catalog or a song page could not be fetched or understood.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RemoteFetchError {
    pub retryable: bool,
    pub message: String,
}

impl RemoteFetchError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

/// Remote catalog collaborator.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Snapshot of every song in the catalog, in catalog order.
    async fn fetch_catalog(&self) -> Result<Vec<RemoteSongRecord>, RemoteFetchError>;

    /// Re-read one song's detail page, resolving current media URLs.
    async fn fetch_song(&self, id: SongId) -> Result<RemoteSongRecord, RemoteFetchError>;

    /// Raw bytes of the song's notes file.
    async fn fetch_notes(&self, id: SongId) -> Result<Bytes, RemoteFetchError>;
}

/// Lowercased file extension of the last path segment of `url`, if any.
///
/// ```
/// use core_sync::catalog::source_extension;
///
/// assert_eq!(source_extension("https://cdn.example/a/Song.MP3?x=1"), Some("mp3".to_string()));
/// assert_eq!(source_extension("https://video.example/watch?v=abc"), None);
/// ```
pub fn source_extension(url: &str) -> Option<String> {
    let path = url.split(&['?', '#'][..]).next().unwrap_or(url);
    let path = path
        .split_once("://")
        .map(|(_, rest)| rest.split_once('/').map_or("", |(_, p)| p))
        .unwrap_or(path);
    let segment = path.rsplit('/').next()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 5 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
