use std::fmt;
use std::time::Duration;

use bridge_traits::{BridgeError, NetworkError};
use core_library::{AssetKind, LibraryError, SongId};
use core_metadata::MetadataError;
use thiserror::Error;

use crate::catalog::RemoteFetchError;

/// Pass-level and job-level failures.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Remote catalog unavailable: {0}")]
    Catalog(RemoteFetchError),

    #[error("Song {0} already has a job in flight")]
    SongBusy(SongId),

    #[error("Invalid sync options: {0}")]
    InvalidOptions(String),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Worker task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Failure of a single asset (or of a whole song job before any asset ran).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssetError {
    /// The song detail page or notes download failed.
    #[error("Remote fetch failed: {message}")]
    RemoteFetch { retryable: bool, message: String },

    #[error(transparent)]
    Network(NetworkError),

    #[error("Transcoder failed ({}): {stderr}", exit_code.map(|c| format!("exit code {c}")).unwrap_or_else(|| "killed".to_string()))]
    TranscodeFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Malformed content: {0}")]
    Malformed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    /// The song job panicked before producing a result.
    #[error("Song job aborted: {0}")]
    Aborted(String),
}

impl AssetError {
    /// Retryable errors are retried at the asset level with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            AssetError::RemoteFetch { retryable, .. } => *retryable,
            AssetError::Network(e) => e.retryable,
            AssetError::Timeout(_) => true,
            AssetError::TranscodeFailed { .. }
            | AssetError::Malformed(_)
            | AssetError::Filesystem(_)
            | AssetError::Aborted(_) => false,
        }
    }

    /// Stable short name used in reports and events.
    pub fn kind_str(&self) -> &'static str {
        match self {
            AssetError::RemoteFetch { .. } => "RemoteFetchError",
            AssetError::Network(_) => "NetworkError",
            AssetError::TranscodeFailed { .. } => "TranscodeFailed",
            AssetError::Malformed(_) => "Malformed",
            AssetError::Timeout(_) => "Timeout",
            AssetError::Filesystem(_) => "FilesystemError",
            AssetError::Aborted(_) => "Aborted",
        }
    }
}

impl From<NetworkError> for AssetError {
    fn from(e: NetworkError) -> Self {
        AssetError::Network(e)
    }
}

impl From<RemoteFetchError> for AssetError {
    fn from(e: RemoteFetchError) -> Self {
        AssetError::RemoteFetch {
            retryable: e.retryable,
            message: e.message,
        }
    }
}

impl From<MetadataError> for AssetError {
    fn from(e: MetadataError) -> Self {
        AssetError::Malformed(e.to_string())
    }
}

impl From<std::io::Error> for AssetError {
    fn from(e: std::io::Error) -> Self {
        AssetError::Filesystem(e.to_string())
    }
}

impl From<LibraryError> for AssetError {
    fn from(e: LibraryError) -> Self {
        AssetError::Filesystem(e.to_string())
    }
}

impl From<BridgeError> for AssetError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::Network(e) => AssetError::Network(e),
            BridgeError::Io(e) => AssetError::Filesystem(e.to_string()),
            // The external tool could not be run at all
            other => AssetError::TranscodeFailed {
                exit_code: None,
                stderr: other.to_string(),
            },
        }
    }
}

/// One entry of [`SyncReport::failed`](crate::SyncReport).
///
/// `kind` is `None` when the song failed before or after its asset steps
/// (detail page fetch, commit I/O).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFailure {
    pub kind: Option<AssetKind>,
    pub error: AssetError,
}

impl AssetFailure {
    pub fn asset(kind: AssetKind, error: AssetError) -> Self {
        Self {
            kind: Some(kind),
            error,
        }
    }

    pub fn song(error: AssetError) -> Self {
        Self { kind: None, error }
    }

    /// Whether this failure prevented the song from committing.
    pub fn is_fatal(&self) -> bool {
        self.kind.map_or(true, |k| k.is_critical())
    }
}

impl fmt::Display for AssetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{}: {} ({})", kind, self.error.kind_str(), self.error),
            None => write!(f, "song: {} ({})", self.error.kind_str(), self.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(AssetError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(AssetError::from(NetworkError::from_status(503, "unavailable")).is_retryable());
        assert!(!AssetError::from(NetworkError::from_status(404, "gone")).is_retryable());
        assert!(!AssetError::Malformed("no notes".into()).is_retryable());
        assert!(!AssetError::TranscodeFailed {
            exit_code: Some(1),
            stderr: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn test_bridge_error_mapping() {
        let err = AssetError::from(BridgeError::NotAvailable("ffmpeg".into()));
        assert_eq!(err.kind_str(), "TranscodeFailed");

        let err = AssetError::from(BridgeError::Network(NetworkError::transport("reset")));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_failure_display() {
        let failure = AssetFailure::asset(
            AssetKind::Cover,
            NetworkError::from_status(404, "not found").into(),
        );
        let text = failure.to_string();
        assert!(text.starts_with("cover: NetworkError"));
        assert!(!failure.is_fatal());

        let failure = AssetFailure::song(AssetError::Filesystem("disk full".into()));
        assert!(failure.is_fatal());
        assert!(failure.to_string().starts_with("song: FilesystemError"));
    }
}
