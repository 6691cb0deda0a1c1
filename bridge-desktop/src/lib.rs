//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `MediaFetcher` using `reqwest`, streaming large files to disk
//! - `Transcoder` spawning `ffmpeg` through `tokio::process`
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{FfmpegTranscoder, ReqwestMediaFetcher};
//! use std::sync::Arc;
//!
//! let fetcher = Arc::new(ReqwestMediaFetcher::new()?);
//! let transcoder = Arc::new(FfmpegTranscoder::new());
//! // Hand both to the sync engine
//! ```

mod http;
mod transcode;

pub use http::ReqwestMediaFetcher;
pub use transcode::FfmpegTranscoder;
