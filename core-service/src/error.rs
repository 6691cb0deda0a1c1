use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Engine initialization failed: {0}")]
    InitializationFailed(String),

    #[error("A sync pass is already running")]
    PassInProgress,

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::Error),

    #[error("Sync error: {0}")]
    Sync(#[from] core_sync::SyncError),

    #[error("Library error: {0}")]
    Library(#[from] core_library::LibraryError),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
