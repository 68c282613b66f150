//! # Data Ingestors Module
//!
//! Concrete [`FetchCapability`](crate::core::ports::FetchCapability)
//! implementations. Each one hides an origin's transport and document shape
//! behind the scheduler's single `fetch(target_id)` call.
//!
//! ## Contained Modules:
//! - **`http_json`**: polls JSON-over-HTTP origins and maps their documents
//!   with JSON pointers.

/// Generic JSON-over-HTTP fetch capability.
pub mod http_json;

pub use http_json::{HttpEndpoint, HttpJsonFetcher, TimeUnit};
