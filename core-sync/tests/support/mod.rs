//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::error::NetworkResult;
use bridge_traits::{MediaFetcher, NetworkError, TranscodeOutput, TranscodeRequest, Transcoder};
use bytes::Bytes;
use core_library::{AssetKind, SongId};
use core_runtime::config::RetryPolicy;
use core_runtime::events::EventBus;
use core_sync::{AssetContext, AssetPipeline, CatalogSource, RemoteFetchError, RemoteSongRecord, SyncOptions};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn id(n: u32) -> SongId {
    SongId::new(n).unwrap()
}

pub fn notes_txt(artist: &str, title: &str) -> String {
    format!(
        "#TITLE:{title}\n#ARTIST:{artist}\n#BPM:200\n#GAP:1000\n\
         : 0 4 5 Hel\n: 4 4 5 lo\n- 10\n: 12 4 7 world\nE\n"
    )
}

pub fn png(width: u32, height: u32) -> Bytes {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
        width,
        height,
        image::Rgb([200, 30, 30]),
    ));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    Bytes::from(buf)
}

/// Record with audio and cover sources under `https://media.example/<n>/`.
pub fn record(n: u32, hash: &str) -> RemoteSongRecord {
    RemoteSongRecord::new(id(n), "Artist", format!("Song {}", n), hash)
        .with_url(AssetKind::Audio, format!("https://media.example/{}/audio.m4a", n))
        .with_url(AssetKind::Cover, format!("https://media.example/{}/cover.png", n))
}

// ============================================================================
// Catalog
// ============================================================================

#[derive(Default)]
pub struct FakeCatalog {
    songs: Mutex<Vec<(RemoteSongRecord, String)>>,
    down: AtomicBool,
    broken_detail: Mutex<Vec<SongId>>,
    panicking_detail: Mutex<Vec<SongId>>,
    notes_delay: Mutex<Duration>,
    notes_in_flight: AtomicUsize,
    pub max_notes_in_flight: AtomicUsize,
    pub notes_calls: AtomicUsize,
}

impl FakeCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add or replace a song, keeping catalog order.
    pub fn put(&self, record: RemoteSongRecord, notes: impl Into<String>) {
        let mut songs = self.songs.lock().unwrap();
        let notes = notes.into();
        match songs.iter_mut().find(|(r, _)| r.id == record.id) {
            Some(slot) => *slot = (record, notes),
            None => songs.push((record, notes)),
        }
    }

    pub fn put_song(&self, n: u32, hash: &str) {
        let record = record(n, hash);
        let notes = notes_txt(&record.artist, &record.title);
        self.put(record, notes);
    }

    pub fn remove(&self, id: SongId) {
        self.songs.lock().unwrap().retain(|(r, _)| r.id != id);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn break_detail(&self, id: SongId) {
        self.broken_detail.lock().unwrap().push(id);
    }

    /// Make the detail lookup of `id` panic, taking its job down with it.
    pub fn panic_on_detail(&self, id: SongId) {
        self.panicking_detail.lock().unwrap().push(id);
    }

    pub fn set_notes_delay(&self, delay: Duration) {
        *self.notes_delay.lock().unwrap() = delay;
    }

    fn find(&self, id: SongId) -> Option<(RemoteSongRecord, String)> {
        self.songs
            .lock()
            .unwrap()
            .iter()
            .find(|(r, _)| r.id == id)
            .cloned()
    }
}

#[async_trait]
impl CatalogSource for FakeCatalog {
    async fn fetch_catalog(&self) -> Result<Vec<RemoteSongRecord>, RemoteFetchError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RemoteFetchError::retryable("usdb unreachable"));
        }
        Ok(self.songs.lock().unwrap().iter().map(|(r, _)| r.clone()).collect())
    }

    async fn fetch_song(&self, id: SongId) -> Result<RemoteSongRecord, RemoteFetchError> {
        if self.panicking_detail.lock().unwrap().contains(&id) {
            panic!("detail parser crashed on song {}", id);
        }
        if self.broken_detail.lock().unwrap().contains(&id) {
            return Err(RemoteFetchError::permanent("detail page changed layout"));
        }
        self.find(id)
            .map(|(r, _)| r)
            .ok_or_else(|| RemoteFetchError::permanent(format!("song {} not found", id)))
    }

    async fn fetch_notes(&self, id: SongId) -> Result<Bytes, RemoteFetchError> {
        self.notes_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.notes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_notes_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.notes_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.notes_in_flight.fetch_sub(1, Ordering::SeqCst);

        self.find(id)
            .map(|(_, notes)| Bytes::from(notes))
            .ok_or_else(|| RemoteFetchError::permanent(format!("song {} not found", id)))
    }
}

// ============================================================================
// Fetcher
// ============================================================================

enum Scripted {
    Fail(NetworkError),
    /// Fail this many times with a retryable error, then serve the bytes
    Flaky(usize, Bytes),
    /// Serve the default body after sleeping this long
    Slow(Duration),
}

/// Serves `b"media:<url>"` for every URL, images for `.png`, unless scripted.
#[derive(Default)]
pub struct FakeFetcher {
    scripted: Mutex<HashMap<String, Scripted>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, url: impl Into<String>, error: NetworkError) {
        self.scripted
            .lock()
            .unwrap()
            .insert(url.into(), Scripted::Fail(error));
    }

    pub fn flaky(&self, url: impl Into<String>, failures: usize) {
        let url = url.into();
        let body = Bytes::from(format!("media:{}", url));
        self.scripted
            .lock()
            .unwrap()
            .insert(url, Scripted::Flaky(failures, body));
    }

    pub fn slow(&self, url: impl Into<String>, delay: Duration) {
        self.scripted
            .lock()
            .unwrap()
            .insert(url.into(), Scripted::Slow(delay));
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl MediaFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> NetworkResult<Bytes> {
        self.calls.lock().unwrap().push(url.to_string());
        let delay = {
            let mut scripted = self.scripted.lock().unwrap();
            match scripted.get_mut(url) {
                Some(Scripted::Fail(e)) => return Err(e.clone()),
                Some(Scripted::Flaky(remaining, body)) => {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(NetworkError::from_status(503, "try again"));
                    }
                    return Ok(body.clone());
                }
                Some(Scripted::Slow(delay)) => Some(*delay),
                None => None,
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if url.ends_with(".png") {
            Ok(png(64, 48))
        } else {
            Ok(Bytes::from(format!("media:{}", url)))
        }
    }
}

// ============================================================================
// Transcoder
// ============================================================================

#[derive(Default)]
pub struct FakeTranscoder {
    pub requests: Mutex<Vec<TranscodeRequest>>,
    failing: AtomicBool,
}

impl FakeTranscoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(
        &self,
        request: &TranscodeRequest,
    ) -> bridge_traits::error::Result<TranscodeOutput> {
        self.requests.lock().unwrap().push(request.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Ok(TranscodeOutput {
                exit_code: Some(1),
                stderr: "Invalid data found when processing input".to_string(),
            });
        }
        tokio::fs::write(&request.output, b"transcoded").await?;
        Ok(TranscodeOutput {
            exit_code: Some(0),
            stderr: String::new(),
        })
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub struct Harness {
    pub catalog: Arc<FakeCatalog>,
    pub fetcher: Arc<FakeFetcher>,
    pub transcoder: Arc<FakeTranscoder>,
    pub events: EventBus,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            catalog: FakeCatalog::new(),
            fetcher: FakeFetcher::new(),
            transcoder: FakeTranscoder::new(),
            events: EventBus::new(1024),
        }
    }

    pub fn pipeline(&self, root: &Path, options: SyncOptions) -> Arc<AssetPipeline> {
        self.pipeline_with_timeout(root, options, Duration::from_secs(5))
    }

    pub fn pipeline_with_timeout(
        &self,
        root: &Path,
        options: SyncOptions,
        fetch_timeout: Duration,
    ) -> Arc<AssetPipeline> {
        let cx = AssetContext {
            catalog: self.catalog.clone(),
            fetcher: self.fetcher.clone(),
            transcoder: self.transcoder.clone(),
            options: Arc::new(options),
            fetch_timeout,
            transcode_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        };
        Arc::new(AssetPipeline::new(root, cx, self.events.clone()))
    }
}

/// Audio and cover only; video and background off.
pub fn audio_cover_options() -> SyncOptions {
    SyncOptions {
        download_video: false,
        download_background: false,
        ..SyncOptions::default()
    }
}

/// Files inside `dir`, sorted, excluding nothing.
pub fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub fn song_dirs(root: &Path) -> BTreeMap<String, Vec<String>> {
    if !root.exists() {
        return BTreeMap::new();
    }
    std::fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_dir())
        .map(|p| (p.file_name().unwrap().to_string_lossy().into_owned(), list_dir(&p)))
        .collect()
}
