//! # Song Sync Module
//!
//! Reconciles the local song library with the remote catalog and carries out
//! the resulting work.
//!
//! ## Overview
//!
//! A pass flows through these components:
//! - **Catalog** (`catalog`): remote records and the `CatalogSource` collaborator
//! - **Planner** (`planner`): local index + remote snapshot → ordered `SyncPlan`
//! - **Asset Pipeline** (`pipeline`): fetch, convert and stage each asset,
//!   then commit the song atomically
//! - **Retry** (`retry`): bounded per-asset retry with exponential backoff
//! - **Song Job State Machine** (`job`): validated job lifecycle
//! - **Scheduler** (`scheduler`): bounded worker pool, in-flight exclusion,
//!   cancellation and the final `SyncReport`

pub mod catalog;
pub mod error;
pub mod job;
pub mod options;
pub mod pipeline;
pub mod planner;
pub mod retry;
pub mod scheduler;

pub use catalog::{CatalogSource, RemoteFetchError, RemoteSongRecord};
pub use error::{AssetError, AssetFailure, Result, SyncError};
pub use job::{JobStatus, SongJob};
pub use options::{AudioFormat, SyncOptions};
pub use pipeline::{AssetContext, AssetHandler, AssetPipeline, SongResult};
pub use planner::{plan, plan_library, required_assets, Action, DeferredRemoval, PlanCounts, SyncPlan};
pub use retry::{RetryDecision, RetryMachine};
pub use scheduler::{InFlight, Scheduler, SyncReport};
