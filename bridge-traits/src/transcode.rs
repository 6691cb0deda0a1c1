//! External Transcoder Abstraction
//!
//! The transcoder runs as a scoped external process. The core only looks at
//! its exit status and stderr; argument construction belongs to the adapter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;

/// Audio codec requested from the transcoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Mp3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeTarget {
    Audio {
        codec: AudioCodec,
        bitrate_kbps: u32,
        normalize: bool,
        /// Image to embed as attached artwork.
        artwork: Option<PathBuf>,
    },
    Video {
        max_height: u32,
        max_fps: u32,
        reencode: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub target: TranscodeTarget,
}

/// What the engine observes of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl TranscodeOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Transcoder collaborator.
///
/// An `Err` means the process could not be run at all (binary missing, spawn
/// failure). A process that ran and failed is reported through
/// [`TranscodeOutput::exit_code`].
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, request: &TranscodeRequest) -> Result<TranscodeOutput>;
}
