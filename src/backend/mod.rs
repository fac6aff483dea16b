//! The seam between [`StoreClient`](crate::StoreClient) and a store.
//!
//! Each method maps to exactly one store primitive. Implementations report
//! transport problems as [`StoreError::Connection`](crate::StoreError) or
//! [`StoreError::Timeout`](crate::StoreError) so the client can track
//! connection state.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::StoreResult;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// One pub/sub message delivered to a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub message: String,
}

/// Messages for one pattern subscription. Ends when the subscription's
/// connection goes away.
pub type NotificationStream = BoxStream<'static, Notification>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// PING
    async fn ping(&self) -> StoreResult<()>;

    /// EXISTS key
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// RPUSH key value; returns the list length after the push.
    async fn rpush(&self, key: &str, value: &str) -> StoreResult<i64>;

    /// LPOP key
    async fn lpop(&self, key: &str) -> StoreResult<Option<String>>;

    /// SET key value [PX millis]
    async fn set(&self, key: &str, value: &str, expiry: Option<Duration>) -> StoreResult<bool>;

    /// DEL key; true if a key was removed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// GET key
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// CONFIG SET notify-keyspace-events <flags>
    async fn enable_keyspace_events(&self, flags: &str) -> StoreResult<()>;

    /// PSUBSCRIBE pattern
    async fn psubscribe(&self, pattern: &str) -> StoreResult<NotificationStream>;

    /// Forget any cached connection so the next call opens a fresh one.
    /// Called when a request was abandoned on timeout and the connection may
    /// be stuck.
    async fn reset(&self) {}
}
