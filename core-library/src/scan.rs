//! Local library index
//!
//! Walks the managed root once and builds the local view of every committed
//! song. The scan never writes; problems with individual directories become
//! [`ScanWarning`]s so one damaged song cannot stop a pass.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use core_metadata::parse_notes;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::error::{LibraryError, Result};
use crate::meta::{content_digest, SyncMeta, SYNC_META_EXTENSION};
use crate::models::{AssetKind, LocalSongEntry, SongId};

/// A song directory that could not be indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanWarning {
    CorruptMeta {
        path: PathBuf,
        reason: String,
    },
    MissingNotes {
        song_id: SongId,
        dir: PathBuf,
    },
    UnparsableNotes {
        song_id: SongId,
        path: PathBuf,
        reason: String,
    },
    DuplicateSong {
        song_id: SongId,
        dir: PathBuf,
        kept: PathBuf,
    },
    Unreadable {
        path: PathBuf,
        reason: String,
    },
}

impl ScanWarning {
    pub fn song_id(&self) -> Option<SongId> {
        match self {
            ScanWarning::MissingNotes { song_id, .. }
            | ScanWarning::UnparsableNotes { song_id, .. }
            | ScanWarning::DuplicateSong { song_id, .. } => Some(*song_id),
            ScanWarning::CorruptMeta { .. } | ScanWarning::Unreadable { .. } => None,
        }
    }
}

impl fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanWarning::CorruptMeta { path, reason } => {
                write!(f, "corrupt sync metadata {}: {}", path.display(), reason)
            }
            ScanWarning::MissingNotes { song_id, dir } => {
                write!(f, "song {} in {} has no notes file", song_id, dir.display())
            }
            ScanWarning::UnparsableNotes {
                song_id,
                path,
                reason,
            } => write!(
                f,
                "song {}: notes file {} is unparsable: {}",
                song_id,
                path.display(),
                reason
            ),
            ScanWarning::DuplicateSong { song_id, dir, kept } => write!(
                f,
                "song {} found again in {} (keeping {})",
                song_id,
                dir.display(),
                kept.display()
            ),
            ScanWarning::Unreadable { path, reason } => {
                write!(f, "cannot read {}: {}", path.display(), reason)
            }
        }
    }
}

/// Result of one library scan
#[derive(Debug, Clone, Default)]
pub struct LibraryScan {
    pub entries: BTreeMap<SongId, LocalSongEntry>,
    pub warnings: Vec<ScanWarning>,
    /// Directories whose sidecar names a song but whose notes are missing or
    /// unparsable. A new download of that song goes back into this directory.
    pub unindexed: BTreeMap<SongId, PathBuf>,
}

impl LibraryScan {
    pub fn get(&self, id: SongId) -> Option<&LocalSongEntry> {
        self.entries.get(&id)
    }

    pub fn unindexed_dir(&self, id: SongId) -> Option<&Path> {
        self.unindexed.get(&id).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Index the managed directory tree rooted at `root`.
///
/// A missing root is an empty library.
#[instrument(skip_all, fields(root = %root.display()))]
pub async fn scan(root: &Path) -> Result<LibraryScan> {
    match tokio::fs::metadata(root).await {
        Ok(meta) if !meta.is_dir() => return Err(LibraryError::InvalidRoot(root.to_path_buf())),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Library root does not exist yet");
            return Ok(LibraryScan::default());
        }
        Err(e) => return Err(e.into()),
    }

    let root = root.to_path_buf();
    let scan = tokio::task::spawn_blocking(move || scan_blocking(&root))
        .await
        .map_err(|e| LibraryError::Task(e.to_string()))?;

    for warning in &scan.warnings {
        warn!(warning = %warning, "Skipping song directory");
    }
    info!(
        songs = scan.entries.len(),
        warnings = scan.warnings.len(),
        "Library scan complete"
    );
    Ok(scan)
}

fn scan_blocking(root: &Path) -> LibraryScan {
    let mut scan = LibraryScan::default();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                scan.warnings.push(ScanWarning::Unreadable {
                    path: e.path().map(Path::to_path_buf).unwrap_or_default(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let is_sidecar = entry.file_type().is_file()
            && entry.path().extension().and_then(|e| e.to_str()) == Some(SYNC_META_EXTENSION);
        if !is_sidecar {
            continue;
        }

        match load_entry(entry.path()) {
            Ok(local) => {
                if let Some(existing) = scan.entries.get(&local.id) {
                    scan.warnings.push(ScanWarning::DuplicateSong {
                        song_id: local.id,
                        dir: local.dir,
                        kept: existing.dir.clone(),
                    });
                } else {
                    scan.entries.insert(local.id, local);
                }
            }
            Err(warning) => {
                if let Some(song_id) = warning.song_id() {
                    let dir = entry.path().parent().map(Path::to_path_buf).unwrap_or_default();
                    scan.unindexed.entry(song_id).or_insert(dir);
                }
                scan.warnings.push(warning);
            }
        }
    }

    let indexed = &scan.entries;
    scan.unindexed.retain(|id, _| !indexed.contains_key(id));
    scan
}

fn load_entry(meta_path: &Path) -> std::result::Result<LocalSongEntry, ScanWarning> {
    let dir = meta_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let meta = SyncMeta::load(meta_path).map_err(|e| ScanWarning::CorruptMeta {
        path: meta_path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let song_id = meta.song_id;

    let notes_path = meta
        .asset_path(&dir, AssetKind::Notes)
        .ok_or_else(|| ScanWarning::MissingNotes {
            song_id,
            dir: dir.clone(),
        })?;

    let bytes = std::fs::read(&notes_path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ScanWarning::MissingNotes {
            song_id,
            dir: dir.clone(),
        },
        _ => ScanWarning::Unreadable {
            path: notes_path.clone(),
            reason: e.to_string(),
        },
    })?;

    parse_notes(&bytes).map_err(|e| ScanWarning::UnparsableNotes {
        song_id,
        path: notes_path.clone(),
        reason: e.to_string(),
    })?;

    // Locally edited notes no longer correspond to the recorded remote hash.
    let digest = content_digest(&bytes);
    let content_hash = if meta.notes_digest.as_deref() == Some(digest.as_str()) {
        meta.src_txt_hash.clone()
    } else {
        None
    };

    let present_assets: BTreeSet<AssetKind> = meta
        .assets
        .iter()
        .filter(|(_, file)| dir.join(&file.fname).is_file())
        .map(|(kind, _)| *kind)
        .collect();

    Ok(LocalSongEntry {
        id: song_id,
        dir,
        content_hash,
        present_assets,
        last_synced_at: meta.last_synced_at,
        absent_passes: meta.absent_passes,
        meta,
    })
}
