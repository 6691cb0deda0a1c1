use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("Invalid song id: {0}")]
    InvalidSongId(String),

    #[error("Invalid asset kind: {0}")]
    InvalidAssetKind(String),

    #[error("Corrupt sync metadata at {path}: {reason}")]
    CorruptMeta { path: PathBuf, reason: String },

    #[error("Library root is not a directory: {0}")]
    InvalidRoot(PathBuf),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, LibraryError>;
