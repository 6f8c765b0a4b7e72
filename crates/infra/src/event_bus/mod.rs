//! Infrastructure-backed notification transports.
//!
//! The bus abstraction and the in-memory bus live in `batchflow-events`.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisNotifierError, RedisPubSubNotifier};
