//! Sync engine façade and bootstrap helpers.
//!
//! This crate wires the host-provided collaborators (remote catalog, media
//! fetcher, transcoder) into the sync core and exposes [`SyncEngine`], the one
//! type a host application talks to. Desktop hosts typically enable the
//! `desktop-shims` feature, which adds [`SyncEngine::desktop`] built on the
//! adapters from `bridge-desktop`.
//!
//! ```no_run
//! # async fn example(catalog: std::sync::Arc<dyn core_sync::CatalogSource>) -> core_service::Result<()> {
//! use core_runtime::config::EngineConfig;
//! use core_runtime::events::EventBus;
//! use core_service::SyncEngine;
//!
//! let config = EngineConfig::builder().library_root("/srv/karaoke").build()?;
//! let events = EventBus::new(config.event_buffer_size);
//! let engine = SyncEngine::desktop(config, catalog, events)?;
//!
//! let report = engine.start_pass().await?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;

pub use engine::SyncEngine;
pub use error::{Result, ServiceError};

pub use core_runtime::config::EngineConfig;
pub use core_sync::{SyncOptions, SyncPlan, SyncReport};
