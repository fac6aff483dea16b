//! Async client for one database on a Redis-compatible key-value store.
//!
//! [`StoreClient`] covers string get/set with optional expiry, list
//! push/pop, key existence and delete. It also publishes connection state
//! changes and key-expiry notifications as [`StoreEvent`]s. Wire protocol,
//! pub/sub transport and reconnect mechanics come from the `redis` crate.
//!
//! ```no_run
//! use kv_client::{StoreClient, StoreConfig, StoreEvent};
//!
//! # async fn example() -> Result<(), kv_client::StoreError> {
//! let client = StoreClient::connect(StoreConfig::new(0, "127.0.0.1", 6379)).await?;
//! let mut events = client.subscribe_events();
//! client.enable_key_expiry_subscription().await?;
//!
//! client.save_with_expiry("session:42", "alice", 1).await?;
//! assert_eq!(client.get("session:42").await?.as_deref(), Some("alice"));
//!
//! while let Some(event) = events.recv().await {
//!     if let StoreEvent::KeyExpired { message, .. } = event {
//!         println!("expired: {message}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod monitor;
pub mod provider;

pub use backend::{Backend, MemoryBackend, Notification, NotificationStream, RedisBackend};
pub use client::StoreClient;
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use event::{EventBus, EventHandle, EventSubscription, StoreEvent};
pub use monitor::{ConnectionMonitor, LinkState};
pub use provider::ConnectionProvider;
