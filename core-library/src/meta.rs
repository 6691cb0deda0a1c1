//! Per-song sync metadata sidecar
//!
//! Every committed song directory contains `<SongId>.usdb`, a small JSON
//! document recording where the song came from and which files belong to it.
//! The sidecar marks a directory as engine-managed; the library scan looks
//! for nothing else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::{LibraryError, Result};
use crate::models::{AssetKind, SongId};

pub const SYNC_META_VERSION: u32 = 1;
pub const SYNC_META_EXTENSION: &str = "usdb";

/// A file recorded in the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub fname: String,
    /// Modification time in milliseconds since the Unix epoch
    pub mtime: i64,
}

impl FileMeta {
    /// Record `fname` inside `dir` with its current modification time.
    pub async fn capture(dir: &Path, fname: impl Into<String>) -> Result<Self> {
        let fname = fname.into();
        let modified = tokio::fs::metadata(dir.join(&fname)).await?.modified()?;
        let mtime = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Ok(Self { fname, mtime })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub version: u32,
    pub song_id: SongId,
    /// Remote content hash of the notes this directory was synced from
    pub src_txt_hash: Option<String>,
    /// SHA-256 of the committed notes bytes
    pub notes_digest: Option<String>,
    pub last_synced_at: DateTime<Utc>,
    #[serde(default)]
    pub absent_passes: u32,
    #[serde(default)]
    pub assets: BTreeMap<AssetKind, FileMeta>,
}

impl SyncMeta {
    pub fn new(song_id: SongId) -> Self {
        Self {
            version: SYNC_META_VERSION,
            song_id,
            src_txt_hash: None,
            notes_digest: None,
            last_synced_at: Utc::now(),
            absent_passes: 0,
            assets: BTreeMap::new(),
        }
    }

    /// `<SongId>.usdb`
    pub fn file_name(song_id: SongId) -> String {
        format!("{}.{}", song_id, SYNC_META_EXTENSION)
    }

    pub fn asset_path(&self, dir: &Path, kind: AssetKind) -> Option<PathBuf> {
        self.assets.get(&kind).map(|f| dir.join(&f.fname))
    }

    pub fn from_json(path: &Path, bytes: &[u8]) -> Result<Self> {
        let meta: SyncMeta =
            serde_json::from_slice(bytes).map_err(|e| LibraryError::CorruptMeta {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if meta.version != SYNC_META_VERSION {
            return Err(LibraryError::CorruptMeta {
                path: path.to_path_buf(),
                reason: format!("unsupported version {}", meta.version),
            });
        }
        Ok(meta)
    }

    /// Blocking read, for use inside the library scan.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_json(path, &bytes)
    }

    pub async fn load_async(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Self::from_json(path, &bytes)
    }

    /// Write the sidecar into `dir` via a temporary file and a rename.
    pub async fn write_atomic(&self, dir: &Path) -> Result<PathBuf> {
        let name = Self::file_name(self.song_id);
        let target = dir.join(&name);
        let tmp = dir.join(format!(".{}.tmp", name));

        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(e.into());
        }
        Ok(target)
    }
}

/// Hex SHA-256 digest of `bytes`.
pub fn content_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SyncMeta {
        let mut meta = SyncMeta::new(SongId::new(7).unwrap());
        meta.src_txt_hash = Some("abc".to_string());
        meta.assets.insert(
            AssetKind::Notes,
            FileMeta {
                fname: "A - T.txt".to_string(),
                mtime: 1,
            },
        );
        meta
    }

    #[test]
    fn test_file_name() {
        assert_eq!(SyncMeta::file_name(SongId::new(7).unwrap()), "00007.usdb");
    }

    #[test]
    fn test_content_digest() {
        assert_eq!(
            content_digest(b"test data"),
            "916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9"
        );
    }

    #[test]
    fn test_json_uses_lowercase_asset_keys() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["song_id"], 7);
        assert_eq!(json["assets"]["notes"]["fname"], "A - T.txt");
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut json = serde_json::to_value(sample()).unwrap();
        json["version"] = 2.into();
        let bytes = serde_json::to_vec(&json).unwrap();

        let err = SyncMeta::from_json(Path::new("x.usdb"), &bytes).unwrap_err();
        assert!(matches!(err, LibraryError::CorruptMeta { .. }));
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let bytes = br#"{"version":1,"song_id":3,"src_txt_hash":null,"notes_digest":null,"last_synced_at":"2024-01-01T00:00:00Z"}"#;
        let meta = SyncMeta::from_json(Path::new("x.usdb"), bytes).unwrap();
        assert_eq!(meta.absent_passes, 0);
        assert!(meta.assets.is_empty());
    }

    #[tokio::test]
    async fn test_write_atomic_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let meta = sample();

        let path = meta.write_atomic(dir.path()).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "00007.usdb");

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);

        let loaded = SyncMeta::load_async(&path).await.unwrap();
        assert_eq!(loaded, meta);
    }
}
