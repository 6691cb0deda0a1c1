//! Domain models for the song library

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{LibraryError, Result};
use crate::meta::SyncMeta;

// =============================================================================
// ID Types
// =============================================================================

/// Largest id the remote catalog hands out.
pub const MAX_SONG_ID: u32 = 99_999;

/// Identifier assigned to a song by the remote catalog.
///
/// Displayed as a five-digit, zero-padded number (`00042`), which is also
/// the stem of the song's sidecar file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct SongId(u32);

impl SongId {
    pub fn new(value: u32) -> Result<Self> {
        if value > MAX_SONG_ID {
            return Err(LibraryError::InvalidSongId(value.to_string()));
        }
        Ok(Self(value))
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for SongId {
    type Error = LibraryError;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SongId> for u32 {
    fn from(id: SongId) -> Self {
        id.0
    }
}

impl fmt::Display for SongId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05}", self.0)
    }
}

impl FromStr for SongId {
    type Err = LibraryError;

    fn from_str(s: &str) -> Result<Self> {
        let value = s
            .trim()
            .parse::<u32>()
            .map_err(|_| LibraryError::InvalidSongId(s.to_string()))?;
        Self::new(value)
    }
}

// =============================================================================
// Assets
// =============================================================================

/// One kind of file belonging to a song.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Notes,
    Audio,
    Video,
    Cover,
    Background,
}

impl AssetKind {
    pub const ALL: [AssetKind; 5] = [
        AssetKind::Notes,
        AssetKind::Audio,
        AssetKind::Video,
        AssetKind::Cover,
        AssetKind::Background,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Notes => "notes",
            AssetKind::Audio => "audio",
            AssetKind::Video => "video",
            AssetKind::Cover => "cover",
            AssetKind::Background => "background",
        }
    }

    /// A song without its critical assets is not worth committing.
    pub fn is_critical(&self) -> bool {
        matches!(self, AssetKind::Notes | AssetKind::Audio)
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetKind {
    type Err = LibraryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "notes" | "txt" => Ok(AssetKind::Notes),
            "audio" => Ok(AssetKind::Audio),
            "video" => Ok(AssetKind::Video),
            "cover" => Ok(AssetKind::Cover),
            "background" => Ok(AssetKind::Background),
            _ => Err(LibraryError::InvalidAssetKind(s.to_string())),
        }
    }
}

// =============================================================================
// Local entries
// =============================================================================

/// Local view of one committed song directory.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalSongEntry {
    pub id: SongId,
    pub dir: PathBuf,
    /// Remote content hash the notes were synced from; `None` when the
    /// committed notes no longer match what was synced.
    pub content_hash: Option<String>,
    pub present_assets: BTreeSet<AssetKind>,
    pub last_synced_at: DateTime<Utc>,
    /// Consecutive passes the song was missing from the remote catalog.
    pub absent_passes: u32,
    pub meta: SyncMeta,
}

impl LocalSongEntry {
    pub fn has(&self, kind: AssetKind) -> bool {
        self.present_assets.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_song_id_display_is_padded() {
        assert_eq!(SongId::new(42).unwrap().to_string(), "00042");
        assert_eq!(SongId::new(MAX_SONG_ID).unwrap().to_string(), "99999");
    }

    #[test]
    fn test_song_id_bounds() {
        assert!(SongId::new(100_000).is_err());
        assert!(SongId::try_from(0).is_ok());
    }

    #[test]
    fn test_song_id_from_str() {
        assert_eq!("00042".parse::<SongId>().unwrap().get(), 42);
        assert_eq!("42".parse::<SongId>().unwrap().get(), 42);
        assert!("abc".parse::<SongId>().is_err());
        assert!("123456".parse::<SongId>().is_err());
    }

    #[test]
    fn test_song_id_serde_validates() {
        let id: SongId = serde_json::from_str("1234").unwrap();
        assert_eq!(id.get(), 1234);
        assert!(serde_json::from_str::<SongId>("100000").is_err());
    }

    #[test]
    fn test_asset_kind_round_trip() {
        for kind in AssetKind::ALL {
            assert_eq!(kind.as_str().parse::<AssetKind>().unwrap(), kind);
        }
        assert!("lyrics".parse::<AssetKind>().is_err());
    }

    #[test]
    fn test_critical_assets() {
        assert!(AssetKind::Notes.is_critical());
        assert!(AssetKind::Audio.is_critical());
        assert!(!AssetKind::Video.is_critical());
        assert!(!AssetKind::Cover.is_critical());
        assert!(!AssetKind::Background.is_critical());
    }
}
