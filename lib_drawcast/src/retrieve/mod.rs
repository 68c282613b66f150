//! # Data Retrieval Module
//!
//! HTTP plumbing shared by the fetch capabilities in `ingestors`. Parsing of
//! origin documents lives with each capability.

/// Per-origin HTTP client with retry middleware.
pub mod ky_http;

pub use ky_http::{http_date_ms, OriginClient, OriginReply};
