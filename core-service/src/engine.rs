//! # Sync Engine
//!
//! Host-facing entry point that runs one pass at a time:
//!
//! 1. Fetch the remote catalog (a failure aborts the pass before any write)
//! 2. Scan the library root into the local index
//! 3. Reconcile both into a [`SyncPlan`]
//! 4. Persist absence counters of songs missing from the catalog
//! 5. Hand the plan to the [`Scheduler`] and return its [`SyncReport`]
//!
//! Options are snapshotted when a pass starts; changing them is refused while
//! a pass runs.

use bridge_traits::{MediaFetcher, Transcoder};
use core_library::{scan, LibraryScan, SongId};
use core_runtime::config::EngineConfig;
use core_runtime::events::{EventBus, PassEvent};
use core_sync::{
    plan_library, Action, AssetContext, AssetPipeline, CatalogSource, InFlight, RemoteFetchError,
    RemoteSongRecord, Scheduler, SyncError, SyncOptions, SyncPlan, SyncReport,
};
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, ServiceError};

struct ActivePass {
    pass_id: String,
    cancel: CancellationToken,
}

/// Clears the active pass slot when a pass ends, however it ends.
struct PassSlot<'a> {
    active: &'a Mutex<Option<ActivePass>>,
}

impl Drop for PassSlot<'_> {
    fn drop(&mut self) {
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

pub struct SyncEngine {
    config: EngineConfig,
    catalog: Arc<dyn CatalogSource>,
    fetcher: Arc<dyn MediaFetcher>,
    transcoder: Arc<dyn Transcoder>,
    events: EventBus,
    options: RwLock<Arc<SyncOptions>>,
    active: Mutex<Option<ActivePass>>,
    in_flight: Arc<InFlight>,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        catalog: Arc<dyn CatalogSource>,
        fetcher: Arc<dyn MediaFetcher>,
        transcoder: Arc<dyn Transcoder>,
        events: EventBus,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            catalog,
            fetcher,
            transcoder,
            events,
            options: RwLock::new(Arc::new(SyncOptions::default())),
            active: Mutex::new(None),
            in_flight: InFlight::new(),
        })
    }

    /// Engine wired to the desktop fetcher and the `ffmpeg` transcoder.
    #[cfg(feature = "desktop-shims")]
    pub fn desktop(
        config: EngineConfig,
        catalog: Arc<dyn CatalogSource>,
        events: EventBus,
    ) -> Result<Self> {
        let fetcher = bridge_desktop::ReqwestMediaFetcher::with_timeout(config.fetch_timeout)
            .map_err(|e| ServiceError::InitializationFailed(e.to_string()))?;
        let transcoder = bridge_desktop::FfmpegTranscoder::new();
        Self::new(
            config,
            catalog,
            Arc::new(fetcher),
            Arc::new(transcoder),
            events,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Options the next pass will use.
    pub fn options(&self) -> SyncOptions {
        self.options_snapshot().as_ref().clone()
    }

    /// Replace the options used by subsequent passes.
    pub fn set_options(&self, options: SyncOptions) -> Result<()> {
        options.validate()?;
        // Hold the slot lock so no pass can start mid-update.
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.is_some() {
            return Err(ServiceError::PassInProgress);
        }
        *self.options.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(options);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Request cancellation of the running pass. No-op when idle.
    pub fn cancel(&self) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pass) = active.as_ref() {
            if !pass.cancel.is_cancelled() {
                info!(pass_id = %pass.pass_id, "Cancelling sync pass");
                pass.cancel.cancel();
                self.events.pass(PassEvent::Cancelled {
                    pass_id: pass.pass_id.clone(),
                });
            }
        }
    }

    /// Compute the plan a pass would execute, without touching the library.
    #[instrument(skip(self))]
    pub async fn dry_run(&self) -> Result<SyncPlan> {
        let options = self.options_snapshot();
        let remote = self.fetch_catalog().await?;
        let local = scan(&self.config.library_root).await?;
        Ok(plan_library(&local, &remote, &options, &self.config.grace))
    }

    /// Run one full sync pass.
    ///
    /// Fails only when the pass cannot start: another pass is running, the
    /// catalog is unavailable or the root cannot be scanned. Per-song failures
    /// are reported in the returned [`SyncReport`].
    #[instrument(skip(self), fields(pass_id = tracing::field::Empty))]
    pub async fn start_pass(&self) -> Result<SyncReport> {
        let (pass_id, cancel, _slot) = self.claim_pass()?;
        tracing::Span::current().record("pass_id", pass_id.as_str());
        let options = self.options_snapshot();
        let root = self.config.library_root.clone();

        info!(root = %root.display(), "Sync pass started");
        self.events.pass(PassEvent::Started {
            pass_id: pass_id.clone(),
            root: root.display().to_string(),
        });

        let remote = match self.fetch_catalog().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "Catalog unavailable, aborting pass");
                self.events.pass(PassEvent::Aborted {
                    pass_id: pass_id.clone(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let local = match scan(&root).await {
            Ok(local) => local,
            Err(e) => {
                self.events.pass(PassEvent::Aborted {
                    pass_id: pass_id.clone(),
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };
        let mut warnings = Vec::with_capacity(local.warnings.len());
        for warning in &local.warnings {
            self.events.pass(PassEvent::ScanWarning {
                pass_id: pass_id.clone(),
                song_id: warning.song_id(),
                message: warning.to_string(),
            });
            warnings.push(warning.to_string());
        }

        let plan = plan_library(&local, &remote, &options, &self.config.grace);
        let counts = plan.counts();
        self.events.pass(PassEvent::Planned {
            pass_id: pass_id.clone(),
            creates: counts.creates,
            updates: counts.updates,
            removes: counts.removes,
            skips: counts.skips,
            deferred_removals: plan.deferred_removals().len(),
        });

        warnings.extend(persist_absence(&local, &plan).await);

        let scheduler = Scheduler::new(
            Arc::new(self.pipeline(options)),
            self.events.clone(),
            self.config.concurrency,
        )
        .with_in_flight(Arc::clone(&self.in_flight));
        let mut report = scheduler.run(&pass_id, &plan, &cancel).await;
        warnings.append(&mut report.warnings);
        report.warnings = warnings;

        scheduler.announce(&report);
        info!(summary = %report.summary(), "Sync pass finished");
        Ok(report)
    }

    fn claim_pass(&self) -> Result<(String, CancellationToken, PassSlot<'_>)> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.is_some() {
            return Err(ServiceError::PassInProgress);
        }
        let pass_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        *active = Some(ActivePass {
            pass_id: pass_id.clone(),
            cancel: cancel.clone(),
        });
        Ok((
            pass_id,
            cancel,
            PassSlot {
                active: &self.active,
            },
        ))
    }

    fn options_snapshot(&self) -> Arc<SyncOptions> {
        Arc::clone(&self.options.read().unwrap_or_else(|e| e.into_inner()))
    }

    async fn fetch_catalog(&self) -> Result<Vec<RemoteSongRecord>> {
        let limit = self.config.fetch_timeout;
        let fetched = match tokio::time::timeout(limit, self.catalog.fetch_catalog()).await {
            Ok(result) => result,
            Err(_) => Err(RemoteFetchError::retryable(format!(
                "catalog fetch timed out after {:?}",
                limit
            ))),
        };
        fetched.map_err(|e| SyncError::Catalog(e).into())
    }

    fn pipeline(&self, options: Arc<SyncOptions>) -> AssetPipeline {
        let cx = AssetContext {
            catalog: Arc::clone(&self.catalog),
            fetcher: Arc::clone(&self.fetcher),
            transcoder: Arc::clone(&self.transcoder),
            options,
            fetch_timeout: self.config.fetch_timeout,
            transcode_timeout: self.config.transcode_timeout,
            retry: self.config.retry,
        };
        AssetPipeline::new(&self.config.library_root, cx, self.events.clone())
    }
}

/// Write the new absence counters into the sidecars.
///
/// Songs missing from the catalog get their incremented counter; songs that
/// are listed again get theirs reset. Returns one warning per sidecar that
/// could not be written.
async fn persist_absence(local: &LibraryScan, plan: &SyncPlan) -> Vec<String> {
    let deferred = plan
        .deferred_removals()
        .iter()
        .map(|d| (d.song_id, d.absent_passes));
    let returned = plan.actions().iter().filter_map(|action| match action {
        Action::Remove(_) => None,
        other => local
            .get(other.song_id())
            .filter(|entry| entry.absent_passes > 0)
            .map(|entry| (entry.id, 0)),
    });

    let mut warnings = Vec::new();
    for (id, absent_passes) in deferred.chain(returned).collect::<Vec<(SongId, u32)>>() {
        let Some(entry) = local.get(id) else {
            continue;
        };
        let mut meta = entry.meta.clone();
        meta.absent_passes = absent_passes;
        match meta.write_atomic(&entry.dir).await {
            Ok(_) => info!(song_id = %id, absent_passes, "Updated absence counter"),
            Err(e) => {
                warn!(song_id = %id, error = %e, "Failed to update absence counter");
                warnings.push(format!("{}: absence counter not saved: {}", id, e));
            }
        }
    }
    warnings
}
