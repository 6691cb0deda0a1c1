//! # Host Bridge Traits
//!
//! Collaborator interfaces the sync engine depends on but does not implement.
//!
//! ## Traits
//!
//! - [`MediaFetcher`](http::MediaFetcher) - Download media bytes from a resolved URL
//! - [`Transcoder`](transcode::Transcoder) - Run the external audio/video converter
//!
//! The remote catalog collaborator lives next to the catalog types in
//! `core-sync`, since its records are expressed in core identity types.
//!
//! ## Error Handling
//!
//! Downloads fail with [`NetworkError`](error::NetworkError), which carries the
//! HTTP status (if any) and whether another attempt makes sense. Everything
//! else uses [`BridgeError`](error::BridgeError).
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so one adapter instance can serve
//! every worker of a sync pass.

pub mod error;
pub mod http;
pub mod transcode;

pub use error::{BridgeError, NetworkError};

pub use http::MediaFetcher;
pub use transcode::{AudioCodec, TranscodeOutput, TranscodeRequest, TranscodeTarget, Transcoder};
