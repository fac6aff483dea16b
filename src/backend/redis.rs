//! [`Backend`] over the `redis` crate.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{
    AsyncCommands, ConnectionAddr, ConnectionInfo, ErrorKind, RedisConnectionInfo, RedisError,
    RedisResult,
};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{Backend, Notification, NotificationStream};
use crate::config::{millis_ceil, StoreConfig};
use crate::error::{StoreError, StoreResult};

/// Server error codes meaning the connection is not authenticated.
const AUTH_ERROR_CODES: [&str; 2] = ["NOAUTH", "WRONGPASS"];

/// The cached connection, tagged with a generation so a failure seen on an
/// old connection never evicts a newer one.
struct ConnectionSlot<C> {
    generation: u64,
    conn: Option<C>,
}

impl<C: Clone> ConnectionSlot<C> {
    fn new() -> Self {
        Self {
            generation: 0,
            conn: None,
        }
    }

    fn cached(&self) -> Option<(u64, C)> {
        self.conn.as_ref().map(|conn| (self.generation, conn.clone()))
    }

    fn install(&mut self, conn: C) -> u64 {
        self.generation += 1;
        self.conn = Some(conn);
        self.generation
    }

    /// Drops the connection only if it is still the one from `generation`.
    fn invalidate(&mut self, generation: u64) -> bool {
        if self.generation != generation || self.conn.is_none() {
            return false;
        }
        self.conn = None;
        true
    }

    fn clear(&mut self) {
        self.conn = None;
    }
}

/// A lazily established, multiplexed connection to one database.
///
/// The connection is opened on first use. A transport error drops it and the
/// next call reconnects, each attempt bounded by the connect timeout.
pub struct RedisBackend {
    client: redis::Client,
    endpoint: String,
    connect_timeout: Duration,
    connection: Mutex<ConnectionSlot<MultiplexedConnection>>,
}

impl RedisBackend {
    /// Validates the parameters; does not touch the network.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
            redis: RedisConnectionInfo {
                db: config.database,
                password: config.password.clone(),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info).map_err(|e| classify(e, ""))?;
        Ok(Self {
            client,
            endpoint: config.endpoint(),
            connect_timeout: config.connect_timeout(),
            connection: Mutex::new(ConnectionSlot::new()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connection(&self) -> StoreResult<(u64, MultiplexedConnection)> {
        // Held across the connect so concurrent callers share one attempt.
        let mut slot = self.connection.lock().await;
        if let Some(cached) = slot.cached() {
            return Ok(cached);
        }

        debug!(endpoint = %self.endpoint, "opening connection");
        let conn = timeout(self.connect_timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError::Timeout(self.connect_timeout))?
            .map_err(|e| classify(e, ""))?;
        let generation = slot.install(conn.clone());
        info!(endpoint = %self.endpoint, generation, "connected");
        Ok((generation, conn))
    }

    async fn settle<T>(&self, generation: u64, key: &str, result: RedisResult<T>) -> StoreResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                let err = classify(err, key);
                if err.is_transport() && self.connection.lock().await.invalidate(generation) {
                    debug!(endpoint = %self.endpoint, generation, error = %err, "dropping connection");
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn ping(&self) -> StoreResult<()> {
        let (generation, mut con) = self.connection().await?;
        let reply: RedisResult<String> = redis::cmd("PING").query_async(&mut con).await;
        self.settle(generation, "", reply).await.map(|_| ())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let (generation, mut con) = self.connection().await?;
        let reply: RedisResult<bool> = con.exists(key).await;
        self.settle(generation, key, reply).await
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<i64> {
        let (generation, mut con) = self.connection().await?;
        let reply: RedisResult<i64> = con.rpush(key, value).await;
        self.settle(generation, key, reply).await
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        let (generation, mut con) = self.connection().await?;
        let reply: RedisResult<Option<String>> = con.lpop(key, None).await;
        self.settle(generation, key, reply).await
    }

    async fn set(&self, key: &str, value: &str, expiry: Option<Duration>) -> StoreResult<bool> {
        let (generation, mut con) = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(expiry) = expiry {
            cmd.arg("PX").arg(millis_ceil(expiry));
        }
        // SET without NX/XX either replies OK or fails.
        let reply: RedisResult<()> = cmd.query_async(&mut con).await;
        self.settle(generation, key, reply).await.map(|_| true)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let (generation, mut con) = self.connection().await?;
        let reply: RedisResult<i64> = con.del(key).await;
        self.settle(generation, key, reply)
            .await
            .map(|removed| removed > 0)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let (generation, mut con) = self.connection().await?;
        let reply: RedisResult<Option<String>> = con.get(key).await;
        self.settle(generation, key, reply).await
    }

    async fn enable_keyspace_events(&self, flags: &str) -> StoreResult<()> {
        let (generation, mut con) = self.connection().await?;
        let reply: RedisResult<()> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg(flags)
            .query_async(&mut con)
            .await;
        self.settle(generation, "", reply).await
    }

    async fn psubscribe(&self, pattern: &str) -> StoreResult<NotificationStream> {
        // Pub/sub needs a dedicated connection; the multiplexed one keeps
        // serving regular commands.
        let mut pubsub = timeout(self.connect_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| StoreError::Timeout(self.connect_timeout))?
            .map_err(|e| classify(e, pattern))?;
        pubsub.psubscribe(pattern).await.map_err(|e| classify(e, pattern))?;
        debug!(endpoint = %self.endpoint, pattern, "pattern subscribed");

        let stream = pubsub.into_on_message().map(|msg| {
            let message = msg
                .get_payload::<String>()
                .unwrap_or_else(|_| String::from_utf8_lossy(msg.get_payload_bytes()).into_owned());
            Notification {
                channel: msg.get_channel_name().to_string(),
                message,
            }
        });
        Ok(stream.boxed())
    }

    async fn reset(&self) {
        self.connection.lock().await.clear();
        debug!(endpoint = %self.endpoint, "connection reset");
    }
}

/// Map a client-library error onto [`StoreError`]. `key` names the key the
/// request targeted, for [`StoreError::TypeMismatch`].
///
/// Authentication failures count as transport errors: the connection cannot
/// serve requests until the credentials are fixed.
fn classify(err: RedisError, key: &str) -> StoreError {
    let code = err.code();
    if code == Some("WRONGTYPE") {
        return StoreError::TypeMismatch { key: key.to_string() };
    }
    if err.kind() == ErrorKind::AuthenticationFailed
        || code.is_some_and(|code| AUTH_ERROR_CODES.contains(&code))
    {
        return StoreError::Connection(format!("authentication failed: {err}"));
    }
    if err.is_timeout() {
        return StoreError::Connection(format!("timed out: {err}"));
    }
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        return StoreError::Connection(err.to_string());
    }
    StoreError::Command(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The error the client library produces for a raw `-...` reply line.
    fn server_error(reply: &[u8]) -> RedisError {
        match redis::parse_redis_value(reply) {
            Ok(value) => match redis::from_owned_redis_value::<String>(value) {
                Err(err) => err,
                Ok(text) => panic!("reply parsed as a value: {text}"),
            },
            Err(err) => err,
        }
    }

    #[test]
    fn open_does_not_connect() {
        // Nothing listens on port 1; opening must still succeed.
        let backend = RedisBackend::open(&StoreConfig::new(0, "127.0.0.1", 1)).unwrap();
        assert_eq!(backend.endpoint(), "127.0.0.1:1");
    }

    #[test]
    fn open_rejects_invalid_config() {
        let config = StoreConfig::new(0, "", 6379);
        assert!(matches!(RedisBackend::open(&config), Err(StoreError::InvalidConfig(_))));
    }

    #[test]
    fn classifies_transport_and_reply_errors() {
        let io = RedisError::from(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert!(classify(io, "k").is_transport());

        let reply = RedisError::from((ErrorKind::ResponseError, "unknown command"));
        assert!(matches!(classify(reply, "k"), StoreError::Command(_)));
    }

    #[test]
    fn wrongtype_reply_is_a_type_mismatch() {
        let err = server_error(b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n");
        assert_eq!(
            classify(err, "jobs"),
            StoreError::TypeMismatch { key: "jobs".into() }
        );
    }

    #[test]
    fn authentication_failures_are_transport_errors() {
        let wrong_password = RedisError::from((
            ErrorKind::AuthenticationFailed,
            "WRONGPASS invalid username-password pair",
        ));
        let err = classify(wrong_password, "");
        assert!(err.is_transport(), "got {err:?}");

        let no_auth = server_error(b"-NOAUTH Authentication required.\r\n");
        assert!(classify(no_auth, "k").is_transport());

        let wrongpass_reply = server_error(b"-WRONGPASS invalid username-password pair or user is disabled.\r\n");
        assert!(classify(wrongpass_reply, "").is_transport());
    }

    #[test]
    fn stale_failure_does_not_evict_newer_connection() {
        let mut slot = ConnectionSlot::new();
        assert_eq!(slot.cached(), None);

        let first = slot.install("first");
        assert_eq!(slot.cached(), Some((first, "first")));
        assert!(slot.invalidate(first));
        assert_eq!(slot.cached(), None);

        let second = slot.install("second");
        // A late failure from a request that ran on the first connection.
        assert!(!slot.invalidate(first));
        assert_eq!(slot.cached(), Some((second, "second")));

        assert!(slot.invalidate(second));
        assert!(!slot.invalidate(second));
    }

    #[test]
    fn clear_drops_whatever_is_cached() {
        let mut slot = ConnectionSlot::new();
        slot.install(1_u8);
        slot.clear();
        assert_eq!(slot.cached(), None);
    }

    #[tokio::test]
    async fn reset_leaves_backend_usable() {
        let config = StoreConfig::new(0, "127.0.0.1", 1).with_connect_timeout(Duration::from_secs(1));
        let backend = RedisBackend::open(&config).unwrap();
        backend.reset().await;
        assert!(backend.ping().await.unwrap_err().is_transport());
    }
}
