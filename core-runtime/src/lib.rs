//! # Core Runtime Module
//!
//! Foundational runtime infrastructure for the sync engine:
//! - Logging and tracing bootstrap
//! - Engine configuration and the retry/grace policies
//! - Event bus carrying pass and song progress
//!
//! ## Overview
//!
//! Every other crate depends on this one for its logging conventions and
//! event types. Nothing here knows how songs are planned or downloaded.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{EngineConfig, GracePolicy, RetryPolicy};
pub use error::{Error, Result};
pub use events::{CoreEvent, EventBus, PassEvent, SongEvent, SongOutcome, SongPhase};
