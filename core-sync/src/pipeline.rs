//! # Asset Pipeline
//!
//! Fetches, converts and commits the assets of one song.
//!
//! ## Workflow
//!
//! 1. Re-read the song's detail page for current media URLs
//! 2. Rename an existing song directory after the current artist and title,
//!    then open a private staging directory (`.staging-*`) inside it
//! 3. Run one [`AssetHandler`] per wanted kind: `fetch`, `validate`, `stage`
//!    (notes and images first, then audio and video so the audio can embed
//!    the freshly staged cover)
//! 4. If a critical asset failed, discard the whole stage
//! 5. Commit: rename staged media into place, then the notes file with its
//!    file references rewritten, then the sidecar
//! 6. Delete files the new sidecar no longer references
//!
//! Nothing inside the song directory is touched before step 5, so a failed
//! or cancelled song leaves its previous state intact. Files replaced during
//! step 5 are set aside in the staging directory and put back if the commit
//! does not reach the sidecar.

use async_trait::async_trait;
use bridge_traits::{MediaFetcher, TranscodeRequest, TranscodeTarget, Transcoder};
use bytes::Bytes;
use chrono::Utc;
use core_library::paths::{asset_file_name, create_unique_dir, ensure_dir_name, song_stem};
use core_library::{content_digest, AssetKind, FileMeta, LocalSongEntry, SongId, SyncMeta};
use core_metadata::{normalize_image, parse_notes, HeaderKey, NotesFile};
use core_runtime::config::RetryPolicy;
use core_runtime::events::{EventBus, SongEvent, SongOutcome, SongPhase};
use core_runtime::logging::redact_url;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{source_extension, CatalogSource, RemoteSongRecord};
use crate::error::{AssetError, AssetFailure};
use crate::options::SyncOptions;
use crate::planner::required_assets;
use crate::retry::retry;

/// Prefix of per-song staging directories.
pub const STAGING_PREFIX: &str = ".staging-";

/// Video containers kept as downloaded when no re-encode is requested.
const KEEP_VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mkv", "avi", "mov", "mpg"];

const FETCH_PHASE: [AssetKind; 3] = [AssetKind::Notes, AssetKind::Cover, AssetKind::Background];
const MEDIA_PHASE: [AssetKind; 2] = [AssetKind::Audio, AssetKind::Video];

// ============================================================================
// Collaborators
// ============================================================================

/// Collaborators and limits shared by every asset step of a pass.
#[derive(Clone)]
pub struct AssetContext {
    pub catalog: Arc<dyn CatalogSource>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub transcoder: Arc<dyn Transcoder>,
    pub options: Arc<SyncOptions>,
    pub fetch_timeout: Duration,
    pub transcode_timeout: Duration,
    pub retry: RetryPolicy,
}

impl AssetContext {
    async fn fetch_bytes(&self, url: &str, cancel: &CancellationToken) -> Result<Bytes, AssetError> {
        let fetcher = &self.fetcher;
        let limit = self.fetch_timeout;
        retry(self.retry, cancel, "fetch", |_| async move {
            with_timeout(limit, fetcher.fetch(url)).await
        })
        .await
    }

    async fn fetch_file(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, AssetError> {
        let fetcher = &self.fetcher;
        let limit = self.fetch_timeout;
        retry(self.retry, cancel, "download", |_| async move {
            with_timeout(limit, fetcher.fetch_to_path(url, dest)).await
        })
        .await
    }

    async fn transcode(
        &self,
        request: &TranscodeRequest,
        cancel: &CancellationToken,
    ) -> Result<(), AssetError> {
        let transcoder = &self.transcoder;
        let limit = self.transcode_timeout;
        retry(self.retry, cancel, "transcode", |_| async move {
            let output = with_timeout(limit, transcoder.transcode(request)).await?;
            if output.success() {
                Ok(())
            } else {
                Err(AssetError::TranscodeFailed {
                    exit_code: output.exit_code,
                    stderr: output.stderr,
                })
            }
        })
        .await
    }
}

async fn with_timeout<T, E>(
    limit: Duration,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, AssetError>
where
    E: Into<AssetError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(AssetError::Timeout(limit)),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Raw source of an asset after `fetch`.
#[derive(Debug)]
pub enum Fetched {
    Bytes(Bytes),
    File {
        path: PathBuf,
        size: u64,
        extension: Option<String>,
    },
}

#[derive(Debug)]
enum StagedContent {
    /// Ready-to-commit file inside the staging directory
    File(PathBuf),
    /// Parsed notes; serialized at commit time once file references are known
    Notes(NotesFile),
}

/// An asset ready to be committed.
#[derive(Debug)]
pub struct StagedFile {
    pub kind: AssetKind,
    /// Name the file will have inside the song directory
    pub file_name: String,
    content: StagedContent,
}

/// Everything a handler needs to know about the song being staged.
pub struct AssetRequest<'a> {
    pub song: &'a RemoteSongRecord,
    pub stem: &'a str,
    pub staging: &'a Path,
    /// Cover image to embed into the audio, if any
    pub artwork: Option<&'a Path>,
    pub cancel: &'a CancellationToken,
}

impl AssetRequest<'_> {
    fn source_url(&self, kind: AssetKind) -> Result<&str, AssetError> {
        self.song.url(kind).ok_or_else(|| AssetError::RemoteFetch {
            retryable: false,
            message: format!("no {} source for song {}", kind, self.song.id),
        })
    }
}

/// Per-kind capability: fetch the source, check it, turn it into a staged file.
#[async_trait]
pub trait AssetHandler: Send + Sync {
    fn kind(&self) -> AssetKind;

    async fn fetch(&self, cx: &AssetContext, req: &AssetRequest<'_>) -> Result<Fetched, AssetError>;

    fn validate(&self, fetched: &Fetched) -> Result<(), AssetError>;

    async fn stage(
        &self,
        cx: &AssetContext,
        req: &AssetRequest<'_>,
        fetched: Fetched,
    ) -> Result<StagedFile, AssetError>;
}

/// The handler responsible for `kind`.
pub fn handler_for(kind: AssetKind) -> &'static dyn AssetHandler {
    match kind {
        AssetKind::Notes => &NotesHandler,
        AssetKind::Audio => &AudioHandler,
        AssetKind::Video => &VideoHandler,
        AssetKind::Cover => &ImageHandler(AssetKind::Cover),
        AssetKind::Background => &ImageHandler(AssetKind::Background),
    }
}

fn not_empty(fetched: &Fetched) -> Result<(), AssetError> {
    let empty = match fetched {
        Fetched::Bytes(bytes) => bytes.is_empty(),
        Fetched::File { size, .. } => *size == 0,
    };
    if empty {
        Err(AssetError::Malformed("empty download".to_string()))
    } else {
        Ok(())
    }
}

fn expect_bytes(fetched: Fetched) -> Result<Bytes, AssetError> {
    match fetched {
        Fetched::Bytes(bytes) => Ok(bytes),
        Fetched::File { path, .. } => Err(AssetError::Filesystem(format!(
            "unexpected file source {}",
            path.display()
        ))),
    }
}

fn expect_file(fetched: Fetched) -> Result<(PathBuf, Option<String>), AssetError> {
    match fetched {
        Fetched::File {
            path, extension, ..
        } => Ok((path, extension)),
        Fetched::Bytes(_) => Err(AssetError::Filesystem(
            "unexpected in-memory source".to_string(),
        )),
    }
}

pub struct NotesHandler;

#[async_trait]
impl AssetHandler for NotesHandler {
    fn kind(&self) -> AssetKind {
        AssetKind::Notes
    }

    async fn fetch(&self, cx: &AssetContext, req: &AssetRequest<'_>) -> Result<Fetched, AssetError> {
        let catalog = &cx.catalog;
        let id = req.song.id;
        let limit = cx.fetch_timeout;
        let bytes = retry(cx.retry, req.cancel, "notes", |_| async move {
            with_timeout(limit, catalog.fetch_notes(id)).await
        })
        .await?;
        Ok(Fetched::Bytes(bytes))
    }

    fn validate(&self, fetched: &Fetched) -> Result<(), AssetError> {
        match fetched {
            Fetched::Bytes(bytes) => parse_notes(bytes).map(|_| ()).map_err(Into::into),
            Fetched::File { .. } => Err(AssetError::Malformed("notes must be text".to_string())),
        }
    }

    async fn stage(
        &self,
        cx: &AssetContext,
        req: &AssetRequest<'_>,
        fetched: Fetched,
    ) -> Result<StagedFile, AssetError> {
        let notes = parse_notes(&expect_bytes(fetched)?)?;
        // Surface unencodable characters now rather than mid-commit
        notes.encode(cx.options.notes_encoding, cx.options.notes_line_ending)?;
        Ok(StagedFile {
            kind: AssetKind::Notes,
            file_name: asset_file_name(req.stem, AssetKind::Notes, "txt"),
            content: StagedContent::Notes(notes),
        })
    }
}

pub struct AudioHandler;

#[async_trait]
impl AssetHandler for AudioHandler {
    fn kind(&self) -> AssetKind {
        AssetKind::Audio
    }

    async fn fetch(&self, cx: &AssetContext, req: &AssetRequest<'_>) -> Result<Fetched, AssetError> {
        fetch_media(cx, req, AssetKind::Audio).await
    }

    fn validate(&self, fetched: &Fetched) -> Result<(), AssetError> {
        not_empty(fetched)
    }

    async fn stage(
        &self,
        cx: &AssetContext,
        req: &AssetRequest<'_>,
        fetched: Fetched,
    ) -> Result<StagedFile, AssetError> {
        let (source, extension) = expect_file(fetched)?;
        let format = cx.options.audio_format;
        let file_name = asset_file_name(req.stem, AssetKind::Audio, format.extension());
        let output = req.staging.join(&file_name);

        if cx.options.audio_needs_transcode(extension.as_deref()) {
            let request = TranscodeRequest {
                input: source.clone(),
                output: output.clone(),
                target: TranscodeTarget::Audio {
                    codec: format.codec(),
                    bitrate_kbps: cx.options.audio_bitrate,
                    normalize: cx.options.normalize_audio,
                    artwork: req
                        .artwork
                        .filter(|_| cx.options.embed_artwork)
                        .map(Path::to_path_buf),
                },
            };
            cx.transcode(&request, req.cancel).await?;
            tokio::fs::remove_file(&source).await.ok();
        } else {
            tokio::fs::rename(&source, &output).await?;
        }

        Ok(StagedFile {
            kind: AssetKind::Audio,
            file_name,
            content: StagedContent::File(output),
        })
    }
}

pub struct VideoHandler;

#[async_trait]
impl AssetHandler for VideoHandler {
    fn kind(&self) -> AssetKind {
        AssetKind::Video
    }

    async fn fetch(&self, cx: &AssetContext, req: &AssetRequest<'_>) -> Result<Fetched, AssetError> {
        fetch_media(cx, req, AssetKind::Video).await
    }

    fn validate(&self, fetched: &Fetched) -> Result<(), AssetError> {
        not_empty(fetched)
    }

    async fn stage(
        &self,
        cx: &AssetContext,
        req: &AssetRequest<'_>,
        fetched: Fetched,
    ) -> Result<StagedFile, AssetError> {
        let (source, extension) = expect_file(fetched)?;

        let (file_name, output) = if cx.options.reencode_video {
            let file_name = asset_file_name(req.stem, AssetKind::Video, "mp4");
            let output = req.staging.join(&file_name);
            let request = TranscodeRequest {
                input: source.clone(),
                output: output.clone(),
                target: TranscodeTarget::Video {
                    max_height: cx.options.video_max_resolution,
                    max_fps: cx.options.video_max_fps,
                    reencode: true,
                },
            };
            cx.transcode(&request, req.cancel).await?;
            tokio::fs::remove_file(&source).await.ok();
            (file_name, output)
        } else {
            let ext = extension
                .filter(|e| KEEP_VIDEO_EXTENSIONS.contains(&e.as_str()))
                .unwrap_or_else(|| "mp4".to_string());
            let file_name = asset_file_name(req.stem, AssetKind::Video, &ext);
            let output = req.staging.join(&file_name);
            tokio::fs::rename(&source, &output).await?;
            (file_name, output)
        };

        Ok(StagedFile {
            kind: AssetKind::Video,
            file_name,
            content: StagedContent::File(output),
        })
    }
}

async fn fetch_media(
    cx: &AssetContext,
    req: &AssetRequest<'_>,
    kind: AssetKind,
) -> Result<Fetched, AssetError> {
    let url = req.source_url(kind)?;
    debug!(kind = %kind, url = %redact_url(url), "Downloading media");
    let dest = req.staging.join(format!(".{}.download", kind));
    let size = cx.fetch_file(url, &dest, req.cancel).await?;
    Ok(Fetched::File {
        path: dest,
        size,
        extension: source_extension(url),
    })
}

/// Cover and background images
pub struct ImageHandler(pub AssetKind);

#[async_trait]
impl AssetHandler for ImageHandler {
    fn kind(&self) -> AssetKind {
        self.0
    }

    async fn fetch(&self, cx: &AssetContext, req: &AssetRequest<'_>) -> Result<Fetched, AssetError> {
        let url = req.source_url(self.0)?;
        Ok(Fetched::Bytes(cx.fetch_bytes(url, req.cancel).await?))
    }

    fn validate(&self, fetched: &Fetched) -> Result<(), AssetError> {
        not_empty(fetched)
    }

    async fn stage(
        &self,
        cx: &AssetContext,
        req: &AssetRequest<'_>,
        fetched: Fetched,
    ) -> Result<StagedFile, AssetError> {
        let bytes = expect_bytes(fetched)?;
        let max_px = cx.options.cover_max_size_px;
        let image = tokio::task::spawn_blocking(move || normalize_image(&bytes, max_px))
            .await
            .map_err(|e| AssetError::Filesystem(format!("image task failed: {}", e)))??;

        let file_name = asset_file_name(req.stem, self.0, "jpg");
        let output = req.staging.join(&file_name);
        tokio::fs::write(&output, &image.bytes).await?;
        debug!(
            kind = %self.0,
            width = image.width,
            height = image.height,
            resized = image.resized,
            "Staged image"
        );

        Ok(StagedFile {
            kind: self.0,
            file_name,
            content: StagedContent::File(output),
        })
    }
}

// ============================================================================
// Staging area
// ============================================================================

/// A song directory plus its private staging directory.
struct SongStage {
    dir: PathBuf,
    /// The directory was created by this job and goes away if nothing commits
    created: bool,
    /// Sidecar of what the directory held before; its files are deleted on
    /// commit unless the new sidecar still references them
    previous: Option<SyncMeta>,
    staging: TempDir,
}

impl SongStage {
    async fn open(dir: PathBuf, created: bool, previous: Option<SyncMeta>) -> io::Result<Self> {
        sweep_stale_staging(&dir).await;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&dir)?;
        Ok(Self {
            dir,
            created,
            previous,
            staging,
        })
    }

    fn path(&self) -> &Path {
        self.staging.path()
    }

    async fn discard(self) {
        let Self {
            dir,
            created,
            staging,
            ..
        } = self;
        if let Err(e) = staging.close() {
            warn!(error = %e, "Failed to remove staging directory");
        }
        if created {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(dir = %dir.display(), error = %e, "Failed to remove new song directory");
            }
        }
    }
}

/// Remove staging directories left behind by an interrupted earlier pass.
async fn sweep_stale_staging(dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let stale = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(STAGING_PREFIX));
        if stale {
            debug!(path = %entry.path().display(), "Removing stale staging directory");
            tokio::fs::remove_dir_all(entry.path()).await.ok();
        }
    }
}

/// Files a commit moved into the song directory, each with the file it
/// replaced, so a commit that stops early can be undone.
struct CommitJournal {
    backups: PathBuf,
    placed: Vec<(PathBuf, Option<PathBuf>)>,
}

impl CommitJournal {
    fn new(backups: PathBuf) -> Self {
        Self {
            backups,
            placed: Vec::new(),
        }
    }

    /// Move `from` to `dir/name`, setting aside whatever is there.
    async fn place(&mut self, from: &Path, dir: &Path, name: &str) -> io::Result<()> {
        let dest = dir.join(name);
        let backup = match tokio::fs::symlink_metadata(&dest).await {
            Ok(_) => {
                tokio::fs::create_dir_all(&self.backups).await?;
                let backup = self.backups.join(name);
                tokio::fs::rename(&dest, &backup).await?;
                Some(backup)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };

        if let Err(e) = tokio::fs::rename(from, &dest).await {
            if let Some(backup) = &backup {
                tokio::fs::rename(backup, &dest).await.ok();
            }
            return Err(e);
        }
        self.placed.push((dest, backup));
        Ok(())
    }

    /// Undo every `place`, newest first.
    async fn roll_back(self) {
        for (dest, backup) in self.placed.into_iter().rev() {
            let undone = match &backup {
                Some(backup) => tokio::fs::rename(backup, &dest).await,
                None => tokio::fs::remove_file(&dest).await,
            };
            match undone {
                Ok(()) => debug!(file = %dest.display(), "Rolled back committed file"),
                Err(e) => warn!(file = %dest.display(), error = %e, "Failed to roll back committed file"),
            }
        }
    }
}

// ============================================================================
// Song pipeline
// ============================================================================

/// Outcome of one song job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SongResult {
    /// The song directory was written. `warnings` lists optional assets that failed.
    Committed {
        created: bool,
        warnings: Vec<AssetFailure>,
    },
    Removed,
    /// Nothing was committed.
    Failed(Vec<AssetFailure>),
    Cancelled,
}

enum Target<'a> {
    /// `reclaim` is a directory left by an earlier copy of the song that the
    /// scan could not index.
    New { reclaim: Option<&'a Path> },
    Existing {
        entry: &'a LocalSongEntry,
        kinds: &'a BTreeSet<AssetKind>,
    },
}

enum CommitError {
    /// Cancellation stopped the commit between two assets.
    Interrupted,
    Failed(AssetFailure),
}

/// Runs the asset steps of song jobs against the managed library root.
pub struct AssetPipeline {
    root: PathBuf,
    cx: AssetContext,
    events: EventBus,
}

impl AssetPipeline {
    pub fn new(root: impl Into<PathBuf>, cx: AssetContext, events: EventBus) -> Self {
        Self {
            root: root.into(),
            cx,
            events,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Download a song that has no local directory yet.
    pub async fn create(&self, id: SongId, cancel: &CancellationToken) -> SongResult {
        self.sync(id, Target::New { reclaim: None }, cancel).await
    }

    /// Download a song into `dir`, which holds an earlier copy of it that is
    /// no longer usable. Falls back to a new directory if `dir` is gone.
    pub async fn recreate(&self, id: SongId, dir: &Path, cancel: &CancellationToken) -> SongResult {
        self.sync(id, Target::New { reclaim: Some(dir) }, cancel)
            .await
    }

    /// Refresh `kinds` of an existing song. Other assets are kept while the
    /// options still want them.
    pub async fn update(
        &self,
        entry: &LocalSongEntry,
        kinds: &BTreeSet<AssetKind>,
        cancel: &CancellationToken,
    ) -> SongResult {
        self.sync(entry.id, Target::Existing { entry, kinds }, cancel)
            .await
    }

    /// Delete a song directory.
    #[instrument(skip_all, fields(song_id = %entry.id))]
    pub async fn remove(&self, entry: &LocalSongEntry) -> SongResult {
        if entry.dir == self.root || !entry.dir.starts_with(&self.root) {
            return SongResult::Failed(vec![AssetFailure::song(AssetError::Filesystem(format!(
                "refusing to delete {} outside the library root",
                entry.dir.display()
            )))]);
        }

        match tokio::fs::remove_dir_all(&entry.dir).await {
            Ok(()) => {
                info!(dir = %entry.dir.display(), "Removed song");
                SongResult::Removed
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => SongResult::Removed,
            Err(e) => SongResult::Failed(vec![AssetFailure::song(e.into())]),
        }
    }

    #[instrument(skip_all, fields(song_id = %id))]
    async fn sync(&self, id: SongId, target: Target<'_>, cancel: &CancellationToken) -> SongResult {
        let detail = match self.fetch_detail(id, cancel).await {
            Ok(detail) => detail,
            Err(_) if cancel.is_cancelled() => return SongResult::Cancelled,
            Err(e) => return SongResult::Failed(vec![AssetFailure::song(e)]),
        };
        if cancel.is_cancelled() {
            return SongResult::Cancelled;
        }

        let wanted = required_assets(&self.cx.options, &detail);
        let (kinds, local, reclaim) = match target {
            Target::New { reclaim } => (wanted.clone(), None, reclaim),
            Target::Existing { entry, kinds } => (kinds.clone(), Some(entry), None),
        };
        let stem = song_stem(&detail.artist, &detail.title);

        let relocated: LocalSongEntry;
        let local = match local {
            Some(entry) => match self.rename_song_dir(&entry.dir, &stem).await {
                Ok(dir) if dir != entry.dir => {
                    info!(from = %entry.dir.display(), to = %dir.display(), "Renamed song directory");
                    relocated = LocalSongEntry {
                        dir,
                        ..entry.clone()
                    };
                    Some(&relocated)
                }
                Ok(_) => Some(entry),
                Err(e) => return SongResult::Failed(vec![AssetFailure::song(e.into())]),
            },
            None => None,
        };

        let stage = match self.open_stage(id, local, reclaim, &stem).await {
            Ok(stage) => stage,
            Err(e) => return SongResult::Failed(vec![AssetFailure::song(e.into())]),
        };

        let results = tokio::select! {
            _ = cancel.cancelled() => None,
            results = self.stage_assets(&detail, &stem, &kinds, local, stage.path(), cancel) => Some(results),
        };
        let Some(results) = results else {
            stage.discard().await;
            return SongResult::Cancelled;
        };

        let mut staged = BTreeMap::new();
        let mut failures = Vec::new();
        for (kind, result) in results {
            match result {
                Ok(file) => {
                    staged.insert(kind, file);
                }
                Err(error) => {
                    warn!(kind = %kind, error = %error, "Asset failed");
                    if !kind.is_critical() {
                        self.events.song(
                            SongEvent::new(id, SongPhase::Staged)
                                .with_asset(kind)
                                .with_outcome(SongOutcome::AssetFailed {
                                    error: error.to_string(),
                                }),
                        );
                    }
                    failures.push(AssetFailure::asset(kind, error));
                }
            }
        }

        if failures.iter().any(AssetFailure::is_fatal) {
            stage.discard().await;
            return SongResult::Failed(failures);
        }
        if cancel.is_cancelled() {
            stage.discard().await;
            return SongResult::Cancelled;
        }

        let fresh_notes = staged.contains_key(&AssetKind::Notes);
        if !fresh_notes {
            let surplus = local.is_some_and(|entry| {
                entry.present_assets.iter().any(|kind| !wanted.contains(kind))
            });
            if staged.is_empty() && !surplus {
                // Every wanted optional asset failed; the song is unchanged.
                stage.discard().await;
                return SongResult::Committed {
                    created: false,
                    warnings: failures,
                };
            }
            match restage_local_notes(local, &stem).await {
                Ok(notes) => {
                    staged.insert(AssetKind::Notes, notes);
                }
                Err(error) => {
                    failures.push(AssetFailure::asset(AssetKind::Notes, error));
                    stage.discard().await;
                    return SongResult::Failed(failures);
                }
            }
        }

        self.events
            .song(SongEvent::new(id, SongPhase::Committing));
        let created = stage.created;
        let committed = self
            .commit(&detail, &stage, staged, &wanted, local, fresh_notes, cancel)
            .await;
        match committed {
            Ok(()) => {
                if let Err(e) = stage.staging.close() {
                    warn!(error = %e, "Failed to remove staging directory");
                }
                info!(
                    created,
                    warnings = failures.len(),
                    "Song committed"
                );
                SongResult::Committed {
                    created,
                    warnings: failures,
                }
            }
            Err(CommitError::Interrupted) => {
                // Rolled back; a new directory without its sidecar is not a song yet.
                stage.discard().await;
                SongResult::Cancelled
            }
            Err(CommitError::Failed(failure)) => {
                stage.discard().await;
                failures.push(failure);
                SongResult::Failed(failures)
            }
        }
    }

    /// Name `dir` after `stem`. The library root itself is never renamed.
    async fn rename_song_dir(&self, dir: &Path, stem: &str) -> io::Result<PathBuf> {
        if dir == self.root || !dir.starts_with(&self.root) {
            return Ok(dir.to_path_buf());
        }
        ensure_dir_name(dir, stem).await
    }

    async fn open_stage(
        &self,
        id: SongId,
        local: Option<&LocalSongEntry>,
        reclaim: Option<&Path>,
        stem: &str,
    ) -> io::Result<SongStage> {
        if let Some(entry) = local {
            return SongStage::open(entry.dir.clone(), false, Some(entry.meta.clone())).await;
        }
        if let Some(dir) = reclaim {
            if tokio::fs::metadata(dir).await.is_ok_and(|m| m.is_dir()) {
                let dir = self.rename_song_dir(dir, stem).await?;
                let previous = SyncMeta::load_async(&dir.join(SyncMeta::file_name(id)))
                    .await
                    .ok();
                debug!(dir = %dir.display(), "Downloading into the song's existing directory");
                return SongStage::open(dir, false, previous).await;
            }
        }
        let dir = create_unique_dir(&self.root, stem).await?;
        SongStage::open(dir, true, None).await
    }

    async fn fetch_detail(
        &self,
        id: SongId,
        cancel: &CancellationToken,
    ) -> Result<RemoteSongRecord, AssetError> {
        let catalog = &self.cx.catalog;
        let limit = self.cx.fetch_timeout;
        let detail = retry(self.cx.retry, cancel, "song detail", |_| async move {
            with_timeout(limit, catalog.fetch_song(id)).await
        })
        .await?;

        if detail.id != id {
            return Err(AssetError::RemoteFetch {
                retryable: false,
                message: format!("detail page for {} returned song {}", id, detail.id),
            });
        }
        Ok(detail)
    }

    async fn stage_assets(
        &self,
        song: &RemoteSongRecord,
        stem: &str,
        kinds: &BTreeSet<AssetKind>,
        local: Option<&LocalSongEntry>,
        staging: &Path,
        cancel: &CancellationToken,
    ) -> BTreeMap<AssetKind, Result<StagedFile, AssetError>> {
        let mut results = BTreeMap::new();

        for phase in [&FETCH_PHASE[..], &MEDIA_PHASE[..]] {
            // Prefer the cover staged in this job, then the committed one.
            let artwork = match results.get(&AssetKind::Cover) {
                Some(Ok(StagedFile {
                    content: StagedContent::File(path),
                    ..
                })) => Some(path.clone()),
                _ => local.and_then(|e| {
                    e.has(AssetKind::Cover)
                        .then(|| e.meta.asset_path(&e.dir, AssetKind::Cover))
                        .flatten()
                }),
            };
            let req = AssetRequest {
                song,
                stem,
                staging,
                artwork: artwork.as_deref(),
                cancel,
            };

            let steps = phase
                .iter()
                .filter(|kind| kinds.contains(*kind))
                .map(|kind| self.run_asset(*kind, &req));
            for (kind, result) in join_all(steps).await {
                results.insert(kind, result);
            }
        }
        results
    }

    async fn run_asset(
        &self,
        kind: AssetKind,
        req: &AssetRequest<'_>,
    ) -> (AssetKind, Result<StagedFile, AssetError>) {
        let id = req.song.id;
        let handler = handler_for(kind);
        self.events
            .song(SongEvent::new(id, SongPhase::Fetching).with_asset(kind));

        let result = async {
            let fetched = handler.fetch(&self.cx, req).await?;
            handler.validate(&fetched)?;
            handler.stage(&self.cx, req, fetched).await
        }
        .await;

        if result.is_ok() {
            self.events
                .song(SongEvent::new(id, SongPhase::Staged).with_asset(kind));
        }
        (kind, result)
    }

    async fn commit(
        &self,
        song: &RemoteSongRecord,
        stage: &SongStage,
        mut staged: BTreeMap<AssetKind, StagedFile>,
        wanted: &BTreeSet<AssetKind>,
        local: Option<&LocalSongEntry>,
        fresh_notes: bool,
        cancel: &CancellationToken,
    ) -> Result<(), CommitError> {
        let failure = |kind: Option<AssetKind>, e: AssetError| {
            CommitError::Failed(AssetFailure {
                kind,
                error: e,
            })
        };

        let Some(notes) = staged.remove(&AssetKind::Notes) else {
            return Err(failure(
                Some(AssetKind::Notes),
                AssetError::Malformed("no notes staged".to_string()),
            ));
        };
        let StagedContent::Notes(mut notes_file) = notes.content else {
            return Err(failure(
                Some(AssetKind::Notes),
                AssetError::Malformed("notes staged as raw file".to_string()),
            ));
        };

        let mut meta = local
            .map(|e| e.meta.clone())
            .unwrap_or_else(|| SyncMeta::new(song.id));
        // Keep committed assets that are still wanted and still on disk; the
        // rest are deleted once the new sidecar is written.
        if let Some(entry) = local {
            meta.assets
                .retain(|kind, _| entry.has(*kind) && wanted.contains(kind));
        }

        // Point the notes at the files the song will consist of after commit.
        notes_file.clear_file_references();
        for (kind, header) in [
            (AssetKind::Audio, HeaderKey::Mp3),
            (AssetKind::Video, HeaderKey::Video),
            (AssetKind::Cover, HeaderKey::Cover),
            (AssetKind::Background, HeaderKey::Background),
        ] {
            let name = staged
                .get(&kind)
                .map(|f| f.file_name.clone())
                .or_else(|| meta.assets.get(&kind).map(|f| f.fname.clone()));
            if let Some(name) = name {
                notes_file.headers.set(header, name);
            }
        }
        let notes_bytes = notes_file
            .encode(self.cx.options.notes_encoding, self.cx.options.notes_line_ending)
            .map_err(|e| failure(Some(AssetKind::Notes), e.into()))?;
        let notes_name = &notes.file_name;
        let staged_notes = stage.path().join(notes_name);
        tokio::fs::write(&staged_notes, &notes_bytes)
            .await
            .map_err(|e| failure(Some(AssetKind::Notes), e.into()))?;

        let mut journal = CommitJournal::new(stage.path().join(".replaced"));
        let placed: Result<(), CommitError> = async {
            for (kind, file) in &staged {
                if cancel.is_cancelled() {
                    return Err(CommitError::Interrupted);
                }
                let StagedContent::File(path) = &file.content else {
                    continue;
                };
                journal
                    .place(path, &stage.dir, &file.file_name)
                    .await
                    .map_err(|e| failure(Some(*kind), e.into()))?;
                let recorded = FileMeta::capture(&stage.dir, file.file_name.clone())
                    .await
                    .map_err(|e| failure(Some(*kind), e.into()))?;
                meta.assets.insert(*kind, recorded);
                debug!(kind = %kind, file = %file.file_name, "Committed asset");
            }

            if cancel.is_cancelled() {
                return Err(CommitError::Interrupted);
            }

            journal
                .place(&staged_notes, &stage.dir, notes_name)
                .await
                .map_err(|e| failure(Some(AssetKind::Notes), e.into()))?;
            let recorded = FileMeta::capture(&stage.dir, notes_name.clone())
                .await
                .map_err(|e| failure(Some(AssetKind::Notes), e.into()))?;
            meta.assets.insert(AssetKind::Notes, recorded);
            meta.notes_digest = Some(content_digest(&notes_bytes));
            if fresh_notes {
                meta.src_txt_hash = Some(song.content_hash.clone());
            }
            meta.last_synced_at = Utc::now();
            meta.absent_passes = 0;
            meta.write_atomic(&stage.dir)
                .await
                .map_err(|e| failure(None, e.into()))?;
            Ok(())
        }
        .await;
        if let Err(e) = placed {
            journal.roll_back().await;
            return Err(e);
        }

        if let Some(old) = &stage.previous {
            remove_unreferenced(&stage.dir, old, &meta).await;
        }
        Ok(())
    }
}

/// Re-read the committed notes so their file references can be rewritten.
async fn restage_local_notes(
    local: Option<&LocalSongEntry>,
    stem: &str,
) -> Result<StagedFile, AssetError> {
    let path = local
        .and_then(|e| e.meta.asset_path(&e.dir, AssetKind::Notes))
        .ok_or_else(|| AssetError::Filesystem("no committed notes file".to_string()))?;
    let bytes = tokio::fs::read(&path).await?;
    Ok(StagedFile {
        kind: AssetKind::Notes,
        file_name: asset_file_name(stem, AssetKind::Notes, "txt"),
        content: StagedContent::Notes(parse_notes(&bytes)?),
    })
}

/// Delete files recorded in `old` that `new` no longer references.
async fn remove_unreferenced(dir: &Path, old: &SyncMeta, new: &SyncMeta) {
    let referenced: BTreeSet<&str> = new.assets.values().map(|f| f.fname.as_str()).collect();
    for file in old.assets.values() {
        if referenced.contains(file.fname.as_str()) {
            continue;
        }
        match tokio::fs::remove_file(dir.join(&file.fname)).await {
            Ok(()) => debug!(file = %file.fname, "Removed replaced file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(file = %file.fname, error = %e, "Failed to remove replaced file"),
        }
    }
}
