//! # Song Library Module
//!
//! Owns the on-disk layout of the managed karaoke library.
//!
//! ## Overview
//!
//! This module manages:
//! - Song and asset identity ([`SongId`], [`AssetKind`])
//! - The per-song sync metadata sidecar ([`SyncMeta`])
//! - File and directory naming ([`paths`])
//! - The read-only library scan that builds the local index ([`scan()`])
//!
//! The directory tree is the only persisted state. The index is rebuilt from
//! it at the start of every pass.

pub mod error;
pub mod meta;
pub mod models;
pub mod paths;
pub mod scan;

pub use error::{LibraryError, Result};
pub use meta::{content_digest, FileMeta, SyncMeta};
pub use models::{AssetKind, LocalSongEntry, SongId};
pub use scan::{scan, LibraryScan, ScanWarning};
