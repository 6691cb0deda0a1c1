//! # Song Job State Machine
//!
//! Lifecycle of one song's work within a pass.
//!
//! ## State Machine
//!
//! ```text
//! Queued → Running → Committed
//!    │         ├────→ Failed
//!    │         └────→ Cancelled
//!    └──────────────→ Cancelled
//! ```
//!
//! Terminal states are final. Retries happen inside an asset step and never
//! send a job back to `Queued`.

use chrono::{DateTime, Utc};
use core_library::SongId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::planner::Action;
use crate::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Committed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Committed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Committed => "committed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "committed" => Ok(JobStatus::Committed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(SyncError::InvalidStateTransition {
                from: s.to_string(),
                to: String::new(),
                reason: "Unknown job status".to_string(),
            }),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One song's unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SongJob {
    pub song_id: SongId,
    pub action: Action,
    pub status: JobStatus,
    /// Summary of the failure, when `status` is `Failed`
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SongJob {
    pub fn new(action: Action) -> Self {
        Self {
            song_id: action.song_id(),
            action,
            status: JobStatus::Queued,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn start(mut self) -> Result<Self> {
        self.validate_transition(JobStatus::Running)?;
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(self)
    }

    pub fn commit(self) -> Result<Self> {
        self.finish(JobStatus::Committed)
    }

    pub fn fail(mut self, error: impl Into<String>) -> Result<Self> {
        self.validate_transition(JobStatus::Failed)?;
        self.error = Some(error.into());
        self.finish(JobStatus::Failed)
    }

    pub fn cancel(self) -> Result<Self> {
        self.finish(JobStatus::Cancelled)
    }

    fn finish(mut self, to: JobStatus) -> Result<Self> {
        self.validate_transition(to)?;
        self.status = to;
        self.finished_at = Some(Utc::now());
        Ok(self)
    }

    fn validate_transition(&self, to: JobStatus) -> Result<()> {
        let valid = matches!(
            (self.status, to),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Committed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        );

        if !valid {
            return Err(SyncError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
                reason: format!(
                    "Cannot transition song {} from {} to {}",
                    self.song_id, self.status, to
                ),
            });
        }
        Ok(())
    }
}
