//! # Song Metadata Module
//!
//! Reading and writing the files that make up a song package.
//!
//! ## Overview
//!
//! This module handles:
//! - Notes file parsing and validation ([`notes`])
//! - Text encodings and line endings of notes files ([`encoding`])
//! - Cover/background image normalization ([`artwork`])
//!
//! Nothing here touches the filesystem or the network; callers pass bytes in
//! and get bytes out.

pub mod artwork;
pub mod encoding;
pub mod error;
pub mod notes;

pub use artwork::{normalize_image, ProcessedImage};
pub use encoding::{decode_text, encode_text, LineEnding, TextEncoding};
pub use error::{MetadataError, Result};
pub use notes::{parse_notes, BodyLine, HeaderKey, Headers, Note, NoteKind, NotesFile};
