//! # Error Taxonomy
//!
//! Every failure the pipeline can observe, grouped by the component that
//! surfaces it. Per-target failures never escape the scheduler: they are
//! folded into cadence decisions and counted. Only catalogue emptiness is
//! fatal to the process.

use thiserror::Error;

/// Failure of a single fetch against an origin.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The fetch did not complete within the hard timeout.
    #[error("fetch timed out after {0} ms")]
    Timeout(u64),

    /// Opaque failure reported by the fetch capability.
    #[error("fetch failed: {0}")]
    Failed(String),
}

/// The result store could not be reached or rejected the write.
#[derive(Debug, Clone, Error)]
#[error("persistence failure: {0}")]
pub struct PersistenceError(pub String);

/// Problems loading the target catalogue.
#[derive(Debug, Error)]
pub enum CatalogueError {
    /// One target definition is unusable; the rest of the catalogue is unaffected.
    #[error("target '{id}' is invalid: {reason}")]
    Invalid {
        /// Identifier of the offending target (may be empty when the id itself is missing).
        id: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Nothing loadable remained after validation.
    #[error("catalogue contains no loadable targets")]
    Empty,

    /// The catalogue file could not be read.
    #[error("I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// The catalogue file is not valid JSON5.
    #[error("catalogue parse error: {0}")]
    Parse(String),
}

/// Rejections from the subscriber registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The process-wide subscriber cap is reached.
    #[error("subscriber limit of {0} reached")]
    TooManySubscribers(usize),

    /// The request would grow the interest set past its limit.
    #[error("interest set limit of {limit} exceeded (requested {requested})")]
    InterestSetTooLarge {
        /// Configured maximum per subscriber.
        limit: usize,
        /// Size the interest set would have reached.
        requested: usize,
    },

    /// The subscriber asked for a target nobody watches.
    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    /// The subscriber id is not (or no longer) registered.
    #[error("unknown subscriber {0}")]
    UnknownSubscriber(u64),
}

impl RegistryError {
    /// Stable machine-readable code used in protocol error replies.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::TooManySubscribers(_) => "too_many_subscribers",
            RegistryError::InterestSetTooLarge { .. } => "interest_set_too_large",
            RegistryError::UnknownTarget(_) => "unknown_target",
            RegistryError::UnknownSubscriber(_) => "unknown_subscriber",
        }
    }
}

/// Errors returned by the scheduler handle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// No target with this id is scheduled.
    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    /// The target exists but is disabled.
    #[error("target '{0}' is disabled")]
    Disabled(String),

    /// The driver loop has stopped.
    #[error("scheduler is not running")]
    Stopped,
}

/// Failures on the external broker path.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Transport-level failure.
    #[error("broker transport error: {0}")]
    Transport(String),

    /// A message on the channel could not be decoded.
    #[error("broker payload error: {0}")]
    Payload(#[from] serde_json::Error),
}
