//! # Sync Scheduler
//!
//! Executes a [`SyncPlan`] with a bounded number of concurrent song jobs.
//!
//! Jobs are dispatched in plan order. A semaphore bounds how many run at once;
//! a job only waits for its own permit, fetches and subprocesses, never for
//! another song. Each song id is claimed in the [`InFlight`] set for the
//! duration of its job so no two jobs ever touch the same directory.
//!
//! Finished jobs are collected while later ones wait for a permit, so their
//! outcome is reported as soon as they end. A job that panics is reported as
//! failed.
//!
//! `cancel()` on the pass token stops dispatching. Queued jobs end as
//! `Cancelled`; running jobs stop at their next asset boundary.

use core_library::SongId;
use core_runtime::events::{EventBus, PassEvent, SongEvent, SongOutcome, SongPhase};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{AssetError, AssetFailure, Result, SyncError};
use crate::job::SongJob;
use crate::pipeline::{AssetPipeline, SongResult};
use crate::planner::{Action, SyncPlan};

// ============================================================================
// In-flight exclusion
// ============================================================================

/// Set of song ids that currently have a running job.
#[derive(Debug, Default)]
pub struct InFlight {
    ids: Mutex<HashSet<SongId>>,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `id` until the returned guard is dropped.
    pub fn claim(self: &Arc<Self>, id: SongId) -> Result<InFlightGuard> {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        if !ids.insert(id) {
            return Err(SyncError::SongBusy(id));
        }
        Ok(InFlightGuard {
            owner: Arc::clone(self),
            id,
        })
    }

    pub fn contains(&self, id: SongId) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the claimed id on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    owner: Arc<InFlight>,
    id: SongId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.owner
            .ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

// ============================================================================
// Report
// ============================================================================

/// Result of a pass.
///
/// A song whose optional asset failed is listed both under its outcome
/// (`created`/`updated`) and in `failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pass_id: String,
    pub created: Vec<SongId>,
    pub updated: Vec<SongId>,
    pub removed: Vec<SongId>,
    pub skipped: Vec<SongId>,
    pub cancelled: Vec<SongId>,
    pub failed: BTreeMap<SongId, Vec<AssetFailure>>,
    /// Non-fatal problems outside any song job (scan warnings, counter updates)
    pub warnings: Vec<String>,
}

impl SyncReport {
    pub fn new(pass_id: impl Into<String>) -> Self {
        Self {
            pass_id: pass_id.into(),
            ..Self::default()
        }
    }

    /// No failures and nothing cancelled.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }

    /// Songs that did not commit at all.
    pub fn failed_songs(&self) -> impl Iterator<Item = SongId> + '_ {
        self.failed
            .iter()
            .filter(|(_, failures)| failures.iter().any(AssetFailure::is_fatal))
            .map(|(id, _)| *id)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} created, {} updated, {} removed, {} skipped, {} failed, {} cancelled",
            self.created.len(),
            self.updated.len(),
            self.removed.len(),
            self.skipped.len(),
            self.failed.len(),
            self.cancelled.len()
        )
    }

    fn record(&mut self, job: &SongJob, result: &SongResult) {
        let id = job.song_id;
        match result {
            SongResult::Committed { created, warnings } => {
                if *created {
                    self.created.push(id);
                } else {
                    self.updated.push(id);
                }
                if !warnings.is_empty() {
                    self.failed.insert(id, warnings.clone());
                }
            }
            SongResult::Removed => self.removed.push(id),
            SongResult::Failed(failures) => {
                self.failed.insert(id, failures.clone());
            }
            SongResult::Cancelled => self.cancelled.push(id),
        }
    }

    fn sort(&mut self) {
        for ids in [
            &mut self.created,
            &mut self.updated,
            &mut self.removed,
            &mut self.skipped,
            &mut self.cancelled,
        ] {
            ids.sort();
        }
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary())?;
        for (id, failures) in &self.failed {
            for failure in failures {
                writeln!(f, "  {} -> {}", id, failure)?;
            }
        }
        for warning in &self.warnings {
            writeln!(f, "  warning: {}", warning)?;
        }
        Ok(())
    }
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct Scheduler {
    pipeline: Arc<AssetPipeline>,
    events: EventBus,
    in_flight: Arc<InFlight>,
    concurrency: usize,
}

impl Scheduler {
    pub fn new(pipeline: Arc<AssetPipeline>, events: EventBus, concurrency: usize) -> Self {
        Self {
            pipeline,
            events,
            in_flight: InFlight::new(),
            concurrency: concurrency.max(1),
        }
    }

    /// Share an exclusion set with other schedulers working on the same root.
    pub fn with_in_flight(mut self, in_flight: Arc<InFlight>) -> Self {
        self.in_flight = in_flight;
        self
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    /// Run every action of `plan` and collect the outcome.
    ///
    /// Always returns a report; per-song failures never abort the pass.
    #[instrument(skip_all, fields(pass_id = %pass_id, actions = plan.len()))]
    pub async fn run(
        &self,
        pass_id: &str,
        plan: &SyncPlan,
        cancel: &CancellationToken,
    ) -> SyncReport {
        let mut report = SyncReport::new(pass_id);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<SongResult> = JoinSet::new();
        let mut running: HashMap<task::Id, SongJob> = HashMap::new();
        let mut pending = Vec::new();

        for action in plan.actions() {
            if let Action::Skip(id) = action {
                report.skipped.push(*id);
                self.events.song(
                    SongEvent::new(*id, SongPhase::Finished).with_outcome(SongOutcome::Skipped),
                );
                continue;
            }
            let job = SongJob::new(action.clone());
            self.events
                .song(SongEvent::new(job.song_id, SongPhase::Queued));
            pending.push(job);
        }

        let mut queue = pending.into_iter();
        while let Some(job) = queue.next() {
            let permit = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break None,
                    Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                        self.collect(&mut report, &mut running, joined);
                    }
                    permit = Arc::clone(&semaphore).acquire_owned() => break permit.ok(),
                }
            };
            let Some(permit) = permit else {
                self.finish_cancelled(&mut report, job);
                for job in queue.by_ref() {
                    self.finish_cancelled(&mut report, job);
                }
                break;
            };

            let guard = match self.in_flight.claim(job.song_id) {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(song_id = %job.song_id, error = %e, "Song already in flight");
                    report.warnings.push(e.to_string());
                    self.finish_cancelled(&mut report, job);
                    continue;
                }
            };

            let job = match job.start() {
                Ok(job) => job,
                Err(e) => {
                    error!(error = %e, "Job could not start");
                    continue;
                }
            };
            self.events
                .song(SongEvent::new(job.song_id, SongPhase::Running));

            let pipeline = Arc::clone(&self.pipeline);
            let cancel = cancel.clone();
            let entry = plan.entry(job.song_id).cloned();
            let reclaim = plan.reclaimed_dir(job.song_id).map(Path::to_path_buf);
            let action = job.action.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                execute(&pipeline, &action, entry.as_ref(), reclaim.as_deref(), &cancel).await
            });
            running.insert(handle.id(), job);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            self.collect(&mut report, &mut running, joined);
        }

        report.sort();
        info!(summary = %report.summary(), "Plan executed");
        report
    }

    /// Report a job that ended, or panicked, as its song's outcome.
    fn collect(
        &self,
        report: &mut SyncReport,
        running: &mut HashMap<task::Id, SongJob>,
        joined: std::result::Result<(task::Id, SongResult), JoinError>,
    ) {
        let (task_id, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "Song job panicked");
                let failure = AssetFailure::song(AssetError::Aborted(e.to_string()));
                (e.id(), SongResult::Failed(vec![failure]))
            }
        };
        match running.remove(&task_id) {
            Some(job) => self.finish(report, job, result),
            None => {
                error!(task = %task_id, "Finished task has no job");
                report.warnings.push(format!("untracked song task {} finished", task_id));
            }
        }
    }

    fn finish(&self, report: &mut SyncReport, job: SongJob, result: SongResult) {
        let id = job.song_id;
        let (job, outcome) = match &result {
            SongResult::Committed { created: true, .. } => (job.commit(), SongOutcome::Created),
            SongResult::Committed { created: false, .. } => (job.commit(), SongOutcome::Updated),
            SongResult::Removed => (job.commit(), SongOutcome::Removed),
            SongResult::Failed(failures) => {
                let summary = failures
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                (
                    job.fail(summary.clone()),
                    SongOutcome::Failed { error: summary },
                )
            }
            SongResult::Cancelled => (job.cancel(), SongOutcome::Cancelled),
        };

        match job {
            Ok(job) => {
                debug!(song_id = %id, status = %job.status, "Job finished");
                report.record(&job, &result);
            }
            Err(e) => error!(song_id = %id, error = %e, "Invalid job transition"),
        }
        self.events
            .song(SongEvent::new(id, SongPhase::Finished).with_outcome(outcome));
    }

    fn finish_cancelled(&self, report: &mut SyncReport, job: SongJob) {
        self.finish(report, job, SongResult::Cancelled);
    }

    /// Emit the `Finished` pass event for `report`.
    pub fn announce(&self, report: &SyncReport) {
        self.events.pass(PassEvent::Finished {
            pass_id: report.pass_id.clone(),
            created: report.created.len(),
            updated: report.updated.len(),
            removed: report.removed.len(),
            skipped: report.skipped.len(),
            failed: report.failed.len(),
            cancelled: report.cancelled.len(),
        });
    }
}

async fn execute(
    pipeline: &AssetPipeline,
    action: &Action,
    entry: Option<&core_library::LocalSongEntry>,
    reclaim: Option<&Path>,
    cancel: &CancellationToken,
) -> SongResult {
    if cancel.is_cancelled() {
        return SongResult::Cancelled;
    }
    match (action, entry) {
        (Action::Create(id), _) => match reclaim {
            Some(dir) => pipeline.recreate(*id, dir, cancel).await,
            None => pipeline.create(*id, cancel).await,
        },
        (Action::UpdateAssets(_, kinds), Some(entry)) => {
            pipeline.update(entry, kinds, cancel).await
        }
        (Action::Remove(_), Some(entry)) => pipeline.remove(entry).await,
        (Action::Skip(_), _) => SongResult::Committed {
            created: false,
            warnings: Vec::new(),
        },
        (action, None) => SongResult::Failed(vec![AssetFailure::song(AssetError::Filesystem(
            format!("no local entry for {}", action),
        ))]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_library::AssetKind;

    fn id(n: u32) -> SongId {
        SongId::new(n).unwrap()
    }

    #[test]
    fn test_in_flight_exclusion() {
        let in_flight = InFlight::new();
        let guard = in_flight.claim(id(1)).unwrap();
        assert!(in_flight.contains(id(1)));
        assert!(matches!(
            in_flight.claim(id(1)),
            Err(SyncError::SongBusy(busy)) if busy == id(1)
        ));

        let other = in_flight.claim(id(2)).unwrap();
        assert_eq!(in_flight.len(), 2);

        drop(guard);
        assert!(!in_flight.contains(id(1)));
        assert!(in_flight.claim(id(1)).is_ok());
        drop(other);
    }

    #[test]
    fn test_report_record_and_summary() {
        let mut report = SyncReport::new("p1");
        let cover_failure = AssetFailure::asset(
            AssetKind::Cover,
            AssetError::Malformed("not an image".into()),
        );

        let job = SongJob::new(Action::Create(id(3))).start().unwrap().commit().unwrap();
        report.record(
            &job,
            &SongResult::Committed {
                created: true,
                warnings: vec![cover_failure.clone()],
            },
        );
        let job = SongJob::new(Action::Create(id(4))).start().unwrap();
        report.record(
            &job,
            &SongResult::Failed(vec![AssetFailure::asset(
                AssetKind::Notes,
                AssetError::Malformed("line 3".into()),
            )]),
        );

        assert_eq!(report.created, vec![id(3)]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed_songs().collect::<Vec<_>>(), vec![id(4)]);
        assert!(!report.is_clean());
        assert_eq!(
            report.summary(),
            "1 created, 0 updated, 0 removed, 0 skipped, 2 failed, 0 cancelled"
        );
        assert!(report.to_string().contains("00003 -> cover: Malformed"));
    }
}
