//! # Engine Configuration
//!
//! Settings that stay fixed for the lifetime of a sync engine: where the
//! library lives, how much work runs in parallel, and how patient the engine
//! is with slow or missing remote content.
//!
//! Per-pass download preferences (which assets, formats, encodings) are not
//! part of this; they travel with each pass as `SyncOptions`.
//!
//! ## Usage
//!
//! ```
//! use core_runtime::config::EngineConfig;
//! use std::time::Duration;
//!
//! let config = EngineConfig::builder()
//!     .library_root("/srv/karaoke/songs")
//!     .concurrency(8)
//!     .fetch_timeout(Duration::from_secs(120))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.retry.max_attempts, 3);
//! assert_eq!(config.grace.min_absent_passes, 2);
//! ```
//!
//! ## Error Handling
//!
//! `build()` runs [`EngineConfig::validate`] and returns
//! [`Error::Config`] with an actionable message:
//!
//! ```
//! use core_runtime::config::EngineConfig;
//!
//! let err = EngineConfig::builder().build().unwrap_err();
//! assert!(err.to_string().contains("library_root"));
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const MAX_CONCURRENCY: usize = 64;

/// Bounded retry of a single asset fetch or conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `next_attempt` (2-based: the first retry is attempt 2).
    ///
    /// Doubles from `base_delay` and is capped at `max_delay`.
    pub fn delay_before(&self, next_attempt: u32) -> Duration {
        let exponent = next_attempt.saturating_sub(2).min(16);
        self.base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay)
    }

    /// No retries, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// When a song missing from the remote catalog may be deleted locally.
///
/// A scrape can silently drop entries, so a single absence is never enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GracePolicy {
    /// Consecutive passes (including the current one) the song must be absent
    pub min_absent_passes: u32,
    /// Additionally require the last successful sync to be at least this old
    pub min_age: Option<Duration>,
}

impl Default for GracePolicy {
    fn default() -> Self {
        Self {
            min_absent_passes: 2,
            min_age: None,
        }
    }
}

/// Engine-wide configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Managed directory; the engine owns everything below it during a pass
    pub library_root: PathBuf,
    /// Maximum number of song jobs running at once
    pub concurrency: usize,
    /// Timeout for one network fetch
    pub fetch_timeout: Duration,
    /// Timeout for one transcoder invocation
    pub transcode_timeout: Duration,
    pub retry: RetryPolicy,
    pub grace: GracePolicy,
    pub event_buffer_size: usize,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.library_root.as_os_str().is_empty() {
            return Err(Error::Config("library_root cannot be empty".to_string()));
        }

        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(Error::Config(format!(
                "concurrency must be between 1 and {}, got {}",
                MAX_CONCURRENCY, self.concurrency
            )));
        }

        if self.fetch_timeout.is_zero() || self.transcode_timeout.is_zero() {
            return Err(Error::Config(
                "fetch_timeout and transcode_timeout must be non-zero".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::Config(
                "retry.max_attempts must be at least 1 (the initial attempt)".to_string(),
            ));
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(Error::Config(
                "retry.base_delay cannot exceed retry.max_delay".to_string(),
            ));
        }

        if self.grace.min_absent_passes == 0 {
            return Err(Error::Config(
                "grace.min_absent_passes must be at least 1; use a larger value to tolerate scrape gaps"
                    .to_string(),
            ));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config("event_buffer_size must be non-zero".to_string()));
        }

        Ok(())
    }
}

/// Builder for [`EngineConfig`]
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    library_root: Option<PathBuf>,
    concurrency: Option<usize>,
    fetch_timeout: Option<Duration>,
    transcode_timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
    grace: Option<GracePolicy>,
    event_buffer_size: Option<usize>,
}

impl EngineConfigBuilder {
    pub fn library_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_root = Some(path.into());
        self
    }

    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = Some(workers);
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn transcode_timeout(mut self, timeout: Duration) -> Self {
        self.transcode_timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn grace(mut self, policy: GracePolicy) -> Self {
        self.grace = Some(policy);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        let library_root = self.library_root.ok_or_else(|| {
            Error::Config("library_root is required. Use .library_root() to set it.".to_string())
        })?;

        let config = EngineConfig {
            library_root,
            concurrency: self.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            fetch_timeout: self.fetch_timeout.unwrap_or(Duration::from_secs(60)),
            transcode_timeout: self.transcode_timeout.unwrap_or(Duration::from_secs(600)),
            retry: self.retry.unwrap_or_default(),
            grace: self.grace.unwrap_or_default(),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
        };

        config.validate()?;
        Ok(config)
    }
}
