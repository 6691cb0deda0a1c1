//! Workspace entry crate.
//!
//! Exposes the sync engine behind feature flags so a host application can
//! depend on `usdb-sync-workspace` alone instead of wiring each crate.

#[cfg(feature = "desktop-shims")]
pub use core_service::*;
