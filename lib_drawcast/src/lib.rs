//! # lib_drawcast
//!
//! A modular library for watching draw-result sources. The `core` folder is
//! always compiled: it holds the per-target polling scheduler, the concurrency
//! governor, the drift calibrator and the subscriber fanout. Everything that
//! talks to the outside world sits behind a folder-based feature gate.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Error taxonomy shared by every module.
pub mod error;
/// Scheduling engine and event fanout.
pub mod core;

/// Target catalogue loading and hot reload.
#[cfg(feature = "configs")]
pub mod configs;
/// Result stores and the external broker path.
#[cfg(feature = "connections")]
pub mod connections;
/// Fetch capabilities for concrete origins.
#[cfg(feature = "ingestors")]
pub mod ingestors;
/// HTTP client with retry middleware.
#[cfg(feature = "retrieve")]
pub mod retrieve;

// Re-export everything a binary needs to wire the pipeline together.
pub use crate::core::*;
pub use error::*;
