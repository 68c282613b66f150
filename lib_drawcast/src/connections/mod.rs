//! # Connections Module
//!
//! Persistent connections to external services: the Redis-backed result
//! store and the Redis pub/sub broker path.

/// Redis result store.
pub mod cache_redis;

/// Redis pub/sub publish and relay.
pub mod redis_broker;

pub use cache_redis::RedisResultStore;
pub use redis_broker::{run_relay, RedisBroker};
