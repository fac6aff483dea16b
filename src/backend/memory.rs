//! In-process [`Backend`] with the store's observable semantics.
//!
//! Strings and lists, optional expiry, WRONGTYPE errors and keyevent expiry
//! notifications behave the way the server does. Time comes from the tokio
//! clock so tests can pause and advance it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::debug;

use super::{Backend, Notification, NotificationStream};
use crate::error::{StoreError, StoreResult};

const NOTIFICATION_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

pub struct MemoryBackend {
    database: i64,
    data: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
    keyspace_events: Mutex<String>,
    notifications: broadcast::Sender<Notification>,
}

impl MemoryBackend {
    /// Keyspace notifications start disabled, as on a fresh server.
    pub fn new(database: i64) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            database,
            data: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            keyspace_events: Mutex::new(String::new()),
            notifications,
        }
    }

    /// Same as `CONFIG SET notify-keyspace-events <flags>` up front.
    pub fn with_keyspace_events(self, flags: &str) -> Self {
        *self.keyspace_events.lock() = flags.to_string();
        self
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`StoreError::Connection`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Remove every expired entry now, publishing a notification for each.
    /// Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut data = self.data.lock();
        let expired: Vec<String> = data
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            data.remove(key);
            self.notify_expired(key);
        }
        expired.len()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.lock().values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Connection("memory backend unavailable".into()))
        }
    }

    /// Looks up a key, dropping it first if it has expired.
    fn live<'a>(&self, data: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        if data.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
            data.remove(key);
            self.notify_expired(key);
            return None;
        }
        data.get_mut(key)
    }

    fn notify_expired(&self, key: &str) {
        let flags = self.keyspace_events.lock();
        let expired_enabled = flags.contains('x') || flags.contains('A');
        if !expired_enabled {
            return;
        }
        if flags.contains('E') {
            let _ = self.notifications.send(Notification {
                channel: format!("__keyevent@{}__:expired", self.database),
                message: key.to_string(),
            });
        }
        if flags.contains('K') {
            let _ = self.notifications.send(Notification {
                channel: format!("__keyspace@{}__:{}", self.database, key),
                message: "expired".to_string(),
            });
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        let mut data = self.data.lock();
        Ok(self.live(&mut data, key).is_some())
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<i64> {
        self.check_available()?;
        let mut data = self.data.lock();
        match self.live(&mut data, key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => {
                list.push_back(value.to_string());
                Ok(list.len() as i64)
            }
            Some(_) => Err(StoreError::TypeMismatch { key: key.to_string() }),
            None => {
                let list = VecDeque::from([value.to_string()]);
                data.insert(
                    key.to_string(),
                    Entry {
                        value: Value::List(list),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        let mut data = self.data.lock();
        let (popped, now_empty) = match self.live(&mut data, key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => {
                let popped = list.pop_front();
                (popped, list.is_empty())
            }
            Some(_) => return Err(StoreError::TypeMismatch { key: key.to_string() }),
            None => return Ok(None),
        };
        // The store never keeps empty lists around.
        if now_empty {
            data.remove(key);
        }
        Ok(popped)
    }

    async fn set(&self, key: &str, value: &str, expiry: Option<Duration>) -> StoreResult<bool> {
        self.check_available()?;
        if expiry.is_some_and(|e| e.is_zero()) {
            return Err(StoreError::Command("invalid expire time in 'set' command".into()));
        }
        let entry = Entry {
            value: Value::Text(value.to_string()),
            expires_at: expiry.map(|ttl| Instant::now() + ttl),
        };
        self.data.lock().insert(key.to_string(), entry);
        Ok(true)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        let mut data = self.data.lock();
        if self.live(&mut data, key).is_none() {
            return Ok(false);
        }
        Ok(data.remove(key).is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        let mut data = self.data.lock();
        match self.live(&mut data, key) {
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(StoreError::TypeMismatch { key: key.to_string() }),
            None => Ok(None),
        }
    }

    async fn enable_keyspace_events(&self, flags: &str) -> StoreResult<()> {
        self.check_available()?;
        *self.keyspace_events.lock() = flags.to_string();
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> StoreResult<NotificationStream> {
        self.check_available()?;
        debug!(pattern, "memory pattern subscription");
        let pattern = pattern.to_string();
        let receiver = self.notifications.subscribe();
        let stream = stream::unfold((receiver, pattern), |(mut receiver, pattern)| async move {
            loop {
                match receiver.recv().await {
                    Ok(n) if glob_match(&pattern, &n.channel) => return Some((n, (receiver, pattern))),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Channel pattern matching with `*` and `?`, as used by PSUBSCRIBE.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}
