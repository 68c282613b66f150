//! # Configuration Modules
//!
//! The target catalogue: its JSON5 file format, the [`ConfigSource`] seam and
//! the hot-reload watcher that reconciles the scheduler with edits.

/// Catalogue format and sources.
pub mod catalogue;

/// Revision polling and reconciliation.
pub mod watcher;

pub use catalogue::{Catalogue, ConfigSource, FileCatalogue, TargetDef};
pub use watcher::{apply_catalogue, CatalogueWatcher, ReloadHook};
