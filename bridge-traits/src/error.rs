use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single media download.
///
/// `status` is the HTTP status when the server answered at all. `retryable`
/// is decided by the fetcher, since only it knows whether the failure was a
/// dropped connection or a definitive answer like 404.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Network error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
pub struct NetworkError {
    pub status: Option<u16>,
    pub retryable: bool,
    pub message: String,
}

impl NetworkError {
    pub fn new(status: Option<u16>, retryable: bool, message: impl Into<String>) -> Self {
        Self {
            status,
            retryable,
            message: message.into(),
        }
    }

    /// Classifies an HTTP status: 408, 429 and 5xx are worth another attempt.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let retryable = status == 408 || status == 429 || (500..600).contains(&status);
        Self::new(Some(status), retryable, message)
    }

    /// Connection-level failure with no response.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(None, true, message)
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(NetworkError::from_status(503, "unavailable").retryable);
        assert!(NetworkError::from_status(429, "slow down").retryable);
        assert!(NetworkError::from_status(408, "timeout").retryable);
        assert!(!NetworkError::from_status(404, "gone").retryable);
        assert!(!NetworkError::from_status(403, "forbidden").retryable);
        assert!(NetworkError::transport("reset").retryable);
    }

    #[test]
    fn test_display_includes_status() {
        let err = NetworkError::from_status(404, "not found");
        assert_eq!(err.to_string(), "Network error (HTTP 404): not found");

        let err = NetworkError::transport("connection reset");
        assert_eq!(err.to_string(), "Network error: connection reset");
    }
}
