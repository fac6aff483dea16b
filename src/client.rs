//! [`StoreClient`]: the public handle.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::backend::{Backend, NotificationStream, RedisBackend};
use crate::config::{millis_ceil, StoreConfig};
use crate::error::{StoreError, StoreResult};
use crate::event::{EventBus, EventHandle, EventSubscription, StoreEvent};
use crate::monitor::{self, ConnectionMonitor};

const EVENT_CAPACITY: usize = 256;

/// Flags enabling keyevent notifications for expired keys.
const EXPIRED_KEYEVENT_FLAGS: &str = "Ex";

const SECS_PER_HOUR: u64 = 3600;

/// Backoff between attempts to re-establish a dropped expiry subscription.
const RESUBSCRIBE_INITIAL_DELAY: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(5);

/// Handle to one database on a remote key-value store.
///
/// Clones share the connection, the event bus and the expiry subscription.
/// Background tasks stop when the last clone is dropped.
#[derive(Clone)]
pub struct StoreClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    config: StoreConfig,
    backend: Arc<dyn Backend>,
    events: EventBus,
    monitor: Arc<ConnectionMonitor>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    expiry_listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        abort_task(&self.heartbeat);
        abort_task(&self.expiry_listener);
    }
}

impl StoreClient {
    /// Connect to the server described by `config`.
    ///
    /// An unreachable server does not fail construction: the first attempt
    /// is bounded by the connect timeout, logged, and the client keeps
    /// retrying in the background. Watch for
    /// [`StoreEvent::ConnectionRestored`] or check
    /// [`is_connected`](Self::is_connected).
    pub async fn connect(config: StoreConfig) -> StoreResult<Self> {
        let backend = RedisBackend::open(&config)?;
        Self::with_backend(Arc::new(backend), config).await
    }

    /// Four-parameter form: database index, host, port and password.
    /// An empty password connects without AUTH.
    pub async fn new(database: i64, host: &str, port: &str, password: &str) -> StoreResult<Self> {
        Self::connect(StoreConfig::from_parts(database, host, port, password)?).await
    }

    /// Build a client over any [`Backend`].
    pub async fn with_backend(backend: Arc<dyn Backend>, config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let endpoint = config.endpoint();
        let events = EventBus::new(EVENT_CAPACITY);
        let monitor = Arc::new(ConnectionMonitor::new(endpoint.clone(), events.clone()));

        let first = monitor::health_check(backend.as_ref(), config.connect_timeout()).await;
        match &first {
            Ok(()) => info!(endpoint = %endpoint, database = config.database, "store client ready"),
            Err(err) => warn!(
                endpoint = %endpoint,
                database = config.database,
                error = %err,
                "initial connection failed, will keep retrying"
            ),
        }
        monitor.observe(&first);

        let heartbeat = config.heartbeat_interval().map(|interval| {
            monitor::spawn_heartbeat(
                backend.clone(),
                monitor.clone(),
                interval,
                config.connect_timeout(),
            )
        });

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                backend,
                events,
                monitor,
                heartbeat: Mutex::new(heartbeat),
                expiry_listener: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn database(&self) -> i64 {
        self.inner.config.database
    }

    /// Whether the last request or health check reached the server.
    pub fn is_connected(&self) -> bool {
        self.inner.monitor.is_connected()
    }

    /// Receive events published from now on. While the connection is down,
    /// the subscription starts with the `ConnectionFailed` for the current
    /// outage, so a failure published before subscribing is not lost.
    pub fn subscribe_events(&self) -> EventSubscription {
        let monitor = &self.inner.monitor;
        self.inner.events.subscribe_with(|| monitor.failure_event())
    }

    /// Run `callback` on a background task for every event
    /// [`subscribe_events`](Self::subscribe_events) would deliver, until the
    /// returned handle is dropped.
    pub fn on_event<F>(&self, callback: F) -> EventHandle
    where
        F: Fn(StoreEvent) + Send + Sync + 'static,
    {
        EventHandle::spawn(self.subscribe_events(), callback)
    }

    /// PING, bounded by the connect timeout.
    pub async fn ping(&self) -> StoreResult<()> {
        let timeout = self.inner.config.connect_timeout();
        self.track(monitor::health_check(self.inner.backend.as_ref(), timeout)).await
    }

    /// Subscribe to key-expiry notifications; each one is published as
    /// [`StoreEvent::KeyExpired`].
    ///
    /// A health check runs first and must succeed within the connect timeout
    /// before anything is registered. Returns once the subscription is in
    /// place. Calling it again while active does nothing.
    ///
    /// If the server later drops the subscription, it is re-established in
    /// the background with backoff until it succeeds or the subscription is
    /// disabled.
    pub async fn enable_key_expiry_subscription(&self) -> StoreResult<()> {
        if self.is_key_expiry_subscribed() {
            debug!("key-expiry subscription already active");
            return Ok(());
        }

        self.ping().await?;

        let listener = ExpiryListener {
            backend: self.inner.backend.clone(),
            events: self.inner.events.clone(),
            monitor: self.inner.monitor.clone(),
            pattern: self.inner.config.expiry_pattern.clone(),
            configure_keyspace_events: self.inner.config.configure_keyspace_events,
        };
        let stream = listener.subscribe().await?;

        let mut slot = self.inner.expiry_listener.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            // Lost a race with a concurrent call; theirs is live.
            return Ok(());
        }
        info!(pattern = %listener.pattern, "key-expiry subscription active");
        *slot = Some(tokio::spawn(listener.run(stream)));
        Ok(())
    }

    pub fn disable_key_expiry_subscription(&self) {
        if let Some(task) = self.inner.expiry_listener.lock().take() {
            task.abort();
            info!("key-expiry subscription stopped");
        }
    }

    pub fn is_key_expiry_subscribed(&self) -> bool {
        self.inner
            .expiry_listener
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Whether `key` exists.
    pub async fn key_exists(&self, key: &str) -> StoreResult<bool> {
        debug!(key, "exists");
        self.track(self.inner.backend.exists(key)).await
    }

    /// Append `value` to the tail of the list at `key`, creating the list if
    /// needed. Returns the list length after the push.
    pub async fn push_message(&self, key: &str, value: &str) -> StoreResult<i64> {
        debug!(key, "rpush");
        self.track(self.inner.backend.rpush(key, value)).await
    }

    /// Remove and return the head of the list at `key`; `None` when the key
    /// does not exist.
    pub async fn pop_message(&self, key: &str) -> StoreResult<Option<String>> {
        debug!(key, "lpop");
        self.track(self.inner.backend.lpop(key)).await
    }

    /// Set `key` to the string `value`, replacing whatever it held.
    pub async fn save(&self, key: &str, value: &str) -> StoreResult<bool> {
        debug!(key, "set");
        self.track(self.inner.backend.set(key, value, None)).await
    }

    /// [`save`](Self::save) with an expiry of `ttl_hours` hours.
    pub async fn save_with_expiry(&self, key: &str, value: &str, ttl_hours: u32) -> StoreResult<bool> {
        if ttl_hours == 0 {
            return Err(StoreError::InvalidArgument("ttl_hours must be at least 1".into()));
        }
        let ttl = Duration::from_secs(u64::from(ttl_hours) * SECS_PER_HOUR);
        self.save_with_ttl(key, value, ttl).await
    }

    /// [`save`](Self::save) with an arbitrary, non-zero expiry.
    pub async fn save_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        if ttl.is_zero() {
            return Err(StoreError::InvalidArgument("ttl must be non-zero".into()));
        }
        debug!(key, ttl_ms = millis_ceil(ttl), "set with expiry");
        self.track(self.inner.backend.set(key, value, Some(ttl))).await
    }

    /// Remove `key`. Returns false if there was nothing to remove.
    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        debug!(key, "del");
        self.track(self.inner.backend.del(key)).await
    }

    /// The string at `key`, or `None` if it does not exist. Fails with
    /// [`StoreError::TypeMismatch`] when the key holds a list.
    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        debug!(key, "get");
        self.track(self.inner.backend.get(key)).await
    }

    /// Stop the heartbeat and the expiry listener now rather than on drop.
    /// Operations keep working.
    pub fn shutdown(&self) {
        abort_task(&self.inner.heartbeat);
        self.disable_key_expiry_subscription();
    }

    async fn track<T>(&self, request: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        let result = request.await;
        self.inner.monitor.observe(&result);
        result
    }

    pub(crate) fn downgrade(&self) -> Weak<ClientInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<ClientInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }
}

/// Forwards expiry notifications as [`StoreEvent::KeyExpired`] and keeps the
/// pattern subscription alive across dropped pub/sub connections.
///
/// Holds the client's parts rather than the client, so a running listener
/// does not keep the client alive.
struct ExpiryListener {
    backend: Arc<dyn Backend>,
    events: EventBus,
    monitor: Arc<ConnectionMonitor>,
    pattern: String,
    configure_keyspace_events: bool,
}

impl ExpiryListener {
    /// One subscription attempt, outcomes fed into the connection monitor.
    async fn subscribe(&self) -> StoreResult<NotificationStream> {
        if self.configure_keyspace_events {
            let enabled = self
                .backend
                .enable_keyspace_events(EXPIRED_KEYEVENT_FLAGS)
                .await;
            self.monitor.observe(&enabled);
            enabled?;
        }
        let stream = self.backend.psubscribe(&self.pattern).await;
        self.monitor.observe(&stream);
        stream
    }

    async fn run(self, mut stream: NotificationStream) {
        loop {
            while let Some(notification) = stream.next().await {
                debug!(channel = %notification.channel, key = %notification.message, "key expired");
                self.events.publish(StoreEvent::KeyExpired {
                    channel: notification.channel,
                    message: notification.message,
                });
            }
            warn!(pattern = %self.pattern, "key-expiry stream closed, resubscribing");
            stream = self.resubscribe().await;
        }
    }

    async fn resubscribe(&self) -> NotificationStream {
        let mut delay = RESUBSCRIBE_INITIAL_DELAY;
        let mut attempt: u32 = 0;
        loop {
            time::sleep(delay).await;
            attempt += 1;
            match self.subscribe().await {
                Ok(stream) => {
                    info!(pattern = %self.pattern, attempt, "key-expiry subscription re-established");
                    return stream;
                }
                Err(err) => {
                    debug!(pattern = %self.pattern, attempt, error = %err, "resubscribe failed");
                    delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
                }
            }
        }
    }
}

fn abort_task(slot: &Mutex<Option<JoinHandle<()>>>) {
    if let Some(task) = slot.lock().take() {
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn quiet_config() -> StoreConfig {
        StoreConfig::new(0, "memory", 6379).with_heartbeat_interval(Duration::ZERO)
    }

    async fn memory_client() -> (Arc<MemoryBackend>, StoreClient) {
        let backend = Arc::new(MemoryBackend::new(0));
        let client = StoreClient::with_backend(backend.clone(), quiet_config()).await.unwrap();
        (backend, client)
    }

    #[tokio::test]
    async fn clones_share_state() {
        let (_backend, client) = memory_client().await;
        let other = client.clone();
        client.save("k", "v").await.unwrap();
        assert_eq!(other.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(other.database(), 0);
        assert!(other.is_connected());
    }

    #[tokio::test]
    async fn rejects_zero_ttl_before_sending() {
        let (backend, client) = memory_client().await;
        assert!(matches!(
            client.save_with_expiry("k", "v", 0).await,
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.save_with_ttl("k", "v", Duration::ZERO).await,
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn health_check_gates_subscription() {
        let (backend, client) = memory_client().await;
        backend.set_available(false);
        assert!(client.enable_key_expiry_subscription().await.unwrap_err().is_transport());
        assert!(!client.is_key_expiry_subscribed());

        backend.set_available(true);
        client.enable_key_expiry_subscription().await.unwrap();
        assert!(client.is_key_expiry_subscribed());
        client.enable_key_expiry_subscription().await.unwrap();

        client.disable_key_expiry_subscription();
        assert!(!client.is_key_expiry_subscribed());
    }

    #[tokio::test]
    async fn shutdown_stops_background_tasks() {
        let backend = Arc::new(MemoryBackend::new(0));
        let config = StoreConfig::new(0, "memory", 6379);
        let client = StoreClient::with_backend(backend, config).await.unwrap();
        client.enable_key_expiry_subscription().await.unwrap();

        client.shutdown();
        assert!(!client.is_key_expiry_subscribed());
        assert!(client.inner.heartbeat.lock().is_none());
        client.save("still", "works").await.unwrap();
    }
}
