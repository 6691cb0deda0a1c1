//! # Reconciliation Planner
//!
//! Diffs the local library index against a remote catalog snapshot and
//! produces an ordered [`SyncPlan`].
//!
//! ## Rules
//!
//! For each remote record, in catalog order:
//! - not present locally: `Create`
//! - present with a different content hash: `UpdateAssets` with notes plus
//!   every required asset
//! - present with the same hash: `UpdateAssets` with the missing required
//!   assets, or `Skip` when nothing is missing. A committed audio or video
//!   file in a format the options no longer produce counts as missing.
//!
//! Local songs missing from the snapshot are removed only once the
//! [`GracePolicy`] allows it; until then they are reported as deferred.
//! `Remove` actions always come after every other action.

use chrono::{DateTime, Utc};
use core_library::{AssetKind, LibraryScan, LocalSongEntry, SongId};
use core_runtime::config::GracePolicy;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::catalog::RemoteSongRecord;
use crate::options::SyncOptions;

/// What the scheduler does with one song.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Skip(SongId),
    Create(SongId),
    /// Fetch the listed kinds and drop committed assets the options no longer
    /// want. An empty set only drops.
    UpdateAssets(SongId, BTreeSet<AssetKind>),
    Remove(SongId),
}

impl Action {
    pub fn song_id(&self) -> SongId {
        match self {
            Action::Skip(id) | Action::Create(id) | Action::Remove(id) => *id,
            Action::UpdateAssets(id, _) => *id,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Action::Skip(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Skip(_) => "skip",
            Action::Create(_) => "create",
            Action::UpdateAssets(..) => "update",
            Action::Remove(_) => "remove",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<6} {}", self.name(), self.song_id())?;
        if let Action::UpdateAssets(_, kinds) = self {
            let kinds: Vec<&str> = kinds.iter().map(AssetKind::as_str).collect();
            write!(f, " [{}]", kinds.join(", "))?;
        }
        Ok(())
    }
}

/// A local song absent from the snapshot that the grace policy kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredRemoval {
    pub song_id: SongId,
    /// Consecutive passes the song has been absent, this one included
    pub absent_passes: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanCounts {
    pub creates: usize,
    pub updates: usize,
    pub removes: usize,
    pub skips: usize,
}

/// Ordered actions for one pass. Immutable once produced.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    actions: Vec<Action>,
    deferred_removals: Vec<DeferredRemoval>,
    records: BTreeMap<SongId, RemoteSongRecord>,
    entries: BTreeMap<SongId, LocalSongEntry>,
    reclaimed: BTreeMap<SongId, PathBuf>,
}

impl SyncPlan {
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// True when every action is a `Skip`.
    pub fn is_noop(&self) -> bool {
        self.actions.iter().all(Action::is_skip)
    }

    pub fn deferred_removals(&self) -> &[DeferredRemoval] {
        &self.deferred_removals
    }

    /// Snapshot record of a song being created or updated.
    pub fn record(&self, id: SongId) -> Option<&RemoteSongRecord> {
        self.records.get(&id)
    }

    /// Local entry of a song being updated, skipped or removed.
    pub fn entry(&self, id: SongId) -> Option<&LocalSongEntry> {
        self.entries.get(&id)
    }

    /// Existing directory a `Create` downloads into instead of a new one.
    pub fn reclaimed_dir(&self, id: SongId) -> Option<&Path> {
        self.reclaimed.get(&id).map(PathBuf::as_path)
    }

    pub fn counts(&self) -> PlanCounts {
        let mut counts = PlanCounts::default();
        for action in &self.actions {
            match action {
                Action::Skip(_) => counts.skips += 1,
                Action::Create(_) => counts.creates += 1,
                Action::UpdateAssets(..) => counts.updates += 1,
                Action::Remove(_) => counts.removes += 1,
            }
        }
        counts
    }
}

impl fmt::Display for SyncPlan {
    /// Dry-run rendering; stable for a given input.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for action in &self.actions {
            writeln!(f, "{}", action)?;
        }
        for deferred in &self.deferred_removals {
            writeln!(
                f,
                "keep   {} (absent for {} pass(es))",
                deferred.song_id, deferred.absent_passes
            )?;
        }
        Ok(())
    }
}

/// Assets a fully synced copy of `record` consists of under `options`.
///
/// Notes are always required; media only when enabled and the record has a
/// source for it.
pub fn required_assets(options: &SyncOptions, record: &RemoteSongRecord) -> BTreeSet<AssetKind> {
    let has = |kind| record.url(kind).is_some();
    let mut kinds = BTreeSet::from([AssetKind::Notes]);

    if options.download_audio && has(AssetKind::Audio) {
        kinds.insert(AssetKind::Audio);
    }
    let video = options.download_video && has(AssetKind::Video);
    if video {
        kinds.insert(AssetKind::Video);
    }
    if options.download_cover && has(AssetKind::Cover) {
        kinds.insert(AssetKind::Cover);
    }
    if options.download_background
        && has(AssetKind::Background)
        && (options.background_even_with_video || !video)
    {
        kinds.insert(AssetKind::Background);
    }
    kinds
}

/// [`plan`] over a whole scan. Songs the scan could not index but whose
/// directory it found are recreated in that directory.
pub fn plan_library(
    scan: &LibraryScan,
    remote: &[RemoteSongRecord],
    options: &SyncOptions,
    grace: &GracePolicy,
) -> SyncPlan {
    let mut plan = plan(&scan.entries, remote, options, grace);
    for action in &plan.actions {
        if let Action::Create(id) = action {
            if let Some(dir) = scan.unindexed_dir(*id) {
                debug!(song_id = %id, dir = %dir.display(), "Recreating song in its existing directory");
                plan.reclaimed.insert(*id, dir.to_path_buf());
            }
        }
    }
    plan
}

/// Reconcile `local` against `remote`.
pub fn plan(
    local: &BTreeMap<SongId, LocalSongEntry>,
    remote: &[RemoteSongRecord],
    options: &SyncOptions,
    grace: &GracePolicy,
) -> SyncPlan {
    plan_at(local, remote, options, grace, Utc::now())
}

/// [`plan`] with an explicit clock, for the age part of the grace policy.
pub fn plan_at(
    local: &BTreeMap<SongId, LocalSongEntry>,
    remote: &[RemoteSongRecord],
    options: &SyncOptions,
    grace: &GracePolicy,
    now: DateTime<Utc>,
) -> SyncPlan {
    let mut plan = SyncPlan::default();
    let mut seen = HashSet::with_capacity(remote.len());

    for record in remote {
        if !seen.insert(record.id) {
            debug!(song_id = %record.id, "Ignoring duplicate catalog entry");
            continue;
        }

        let action = match local.get(&record.id) {
            None => Action::Create(record.id),
            Some(entry) if entry.content_hash.as_deref() != Some(record.content_hash.as_str()) => {
                let mut kinds = required_assets(options, record);
                kinds.insert(AssetKind::Notes);
                Action::UpdateAssets(record.id, kinds)
            }
            Some(entry) => {
                let required = required_assets(options, record);
                let missing: BTreeSet<AssetKind> = required
                    .iter()
                    .copied()
                    .filter(|kind| !entry.has(*kind) || !in_current_format(entry, *kind, options))
                    .collect();
                let surplus = entry.present_assets.iter().any(|kind| !required.contains(kind));
                if missing.is_empty() && !surplus {
                    Action::Skip(record.id)
                } else {
                    Action::UpdateAssets(record.id, missing)
                }
            }
        };

        if !matches!(action, Action::Skip(_)) {
            plan.records.insert(record.id, record.clone());
        }
        if let Some(entry) = local.get(&record.id) {
            plan.entries.insert(record.id, entry.clone());
        }
        plan.actions.push(action);
    }

    for (id, entry) in local {
        if seen.contains(id) {
            continue;
        }
        let absent_passes = entry.absent_passes.saturating_add(1);
        if may_remove(entry, absent_passes, grace, now) {
            plan.actions.push(Action::Remove(*id));
            plan.entries.insert(*id, entry.clone());
        } else {
            plan.deferred_removals.push(DeferredRemoval {
                song_id: *id,
                absent_passes,
            });
        }
    }

    let counts = plan.counts();
    info!(
        creates = counts.creates,
        updates = counts.updates,
        removes = counts.removes,
        skips = counts.skips,
        deferred = plan.deferred_removals.len(),
        "Sync plan ready"
    );
    plan
}

/// False when the committed file of `kind` was produced for other format
/// options than `options`.
fn in_current_format(entry: &LocalSongEntry, kind: AssetKind, options: &SyncOptions) -> bool {
    let Some(file) = entry.meta.assets.get(&kind) else {
        return true;
    };
    let ext = Path::new(&file.fname)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match kind {
        AssetKind::Audio => ext.as_deref() == Some(options.audio_format.extension()),
        AssetKind::Video if options.reencode_video => ext.as_deref() == Some("mp4"),
        _ => true,
    }
}

fn may_remove(
    entry: &LocalSongEntry,
    absent_passes: u32,
    grace: &GracePolicy,
    now: DateTime<Utc>,
) -> bool {
    if absent_passes < grace.min_absent_passes {
        return false;
    }
    match grace.min_age {
        Some(min_age) => {
            let age = (now - entry.last_synced_at).to_std().unwrap_or_default();
            age >= min_age
        }
        None => true,
    }
}
