//! # Capability Seams
//!
//! The scheduler and the fanout never know how results are fetched, stored
//! or forwarded. They talk to these traits; concrete implementations live in
//! the `ingestors` and `connections` feature modules (and in
//! [`crate::core::store`] for the in-process store).

use async_trait::async_trait;

use crate::core::model::{DrawResult, Observation};
use crate::error::{BrokerError, FetchError, PersistenceError};

/// Retrieves the latest result of a target from its origin.
///
/// Implementations must be safe to call concurrently for different targets.
/// The scheduler enforces its own hard timeout around every call.
#[async_trait]
pub trait FetchCapability: Send + Sync {
    /// Fetches the newest result known to the origin.
    async fn fetch(&self, target_id: &str) -> Result<Observation, FetchError>;
}

/// Outcome of a save.
#[derive(Debug, Clone)]
pub enum SaveOutcome {
    /// The `(target_id, sequence)` pair was new.
    Inserted,
    /// The pair was already stored; nothing changed.
    Duplicate,
    /// The store could not be reached or refused the write.
    Failed(PersistenceError),
}

/// Durable, idempotent storage keyed by `(target_id, sequence)`.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Inserts the result unless the pair already exists.
    async fn save(&self, result: &DrawResult) -> SaveOutcome;

    /// Most recently saved result of a target.
    async fn latest(&self, target_id: &str) -> Result<Option<DrawResult>, PersistenceError>;
}

/// Optional external pub/sub path for published results.
#[async_trait]
pub trait ResultBroker: Send + Sync {
    /// Forwards one result.
    async fn publish(&self, result: &DrawResult) -> Result<(), BrokerError>;
}
