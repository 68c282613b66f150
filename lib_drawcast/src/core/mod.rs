//! # Core Engine Module
//!
//! The heart of `lib_drawcast`: everything needed to decide when to poll each
//! target, to run those polls under concurrency limits, and to push new
//! results to subscribers. Nothing in here performs network I/O directly;
//! origins, stores and brokers are reached through the traits in [`ports`].
//!
//! ## Core Components:
//!
//! - **`target`**: the catalogue of watched sources and their timing classes.
//! - **`cadence`**: the interval function. Each timing class resolves once
//!   into a policy that maps poll state and time to the next delay.
//! - **`poll_state`**: per-target bookkeeping and the pure transition applied
//!   after every fetch (stale retries, failure backoff, DEGRADED).
//! - **`clock`**: clock abstraction and the process-wide drift calibrator.
//! - **`governor`**: per-target busy flags and the global FIFO fetch cap.
//! - **`scheduler`**: the driver loop that owns timers and spawns ticks.
//! - **`registry`**: forward and reverse subscription indices.
//! - **`dispatcher`**: the zero-copy event fanout with snapshot-on-subscribe.
//! - **`metrics`**: counters and the per-target status board.
//! - **`session`**: the push protocol for one connected subscriber.

/// Catalogue of watched sources.
pub mod target;
/// Results, observations and the push protocol messages.
pub mod model;
/// Clock abstraction and drift calibration.
pub mod clock;
/// Interval function per timing class.
pub mod cadence;
/// Per-target state transitions.
pub mod poll_state;
/// Busy flags and the global concurrency cap.
pub mod governor;
/// Counters and per-target status.
pub mod metrics;
/// Fetch, store and broker seams.
pub mod ports;
/// In-process result store.
pub mod store;
/// Subscriber indices.
pub mod registry;
/// Event fanout.
pub mod dispatcher;
/// Scheduler driver loop and its handle.
pub mod scheduler;
/// Subscriber protocol handling.
pub mod session;

// --- Public API Re-exports ---
pub use cadence::{Cadence, CadencePolicy, Estimate};
pub use clock::{Clock, DriftCalibrator, ManualClock, RuntimeClock, SystemClock};
pub use dispatcher::{EventFanout, Frame, Subscription, DEFAULT_COMPRESS_THRESHOLD, GZIP_BASE64};
pub use governor::{FetchPermit, GovernorStats, PollGovernor};
pub use metrics::{FanoutMetricsSnapshot, PollMetricsSnapshot, StatusBoard, TargetStatus};
pub use model::{ClientMessage, DrawResult, Observation, ProtocolError, ServerMessage, UpdateBody};
pub use poll_state::{Phase, PollState, TickDecision, TickSignal};
pub use ports::{FetchCapability, ResultBroker, ResultStore, SaveOutcome};
pub use registry::{DeliveryReport, SubscriberId, SubscriberLimits, SubscriberRegistry};
pub use scheduler::{PollScheduler, SchedulerConfig, SchedulerHandle, SchedulerMetrics, TriggerAck};
pub use session::{Outbound, SubscriberSession};
pub use store::MemoryResultStore;
pub use target::{CatalogueDiff, DrawWindow, PollTuning, Target, TargetRegistry, TimingClass};
