//! Sharing one connection per database across the process.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{OnceLock, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::client::{ClientInner, StoreClient};
use crate::config::StoreConfig;
use crate::error::StoreResult;

/// What makes two configs share a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConnectionKey {
    host: String,
    port: u16,
    password: Option<String>,
    database: i64,
}

impl From<&StoreConfig> for ConnectionKey {
    fn from(config: &StoreConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            password: config.password.clone(),
            database: config.database,
        }
    }
}

/// Hands out shared [`StoreClient`]s, one per (endpoint, password,
/// database). Only weak references are kept: once every clone of a client is
/// dropped its connection goes away and the next request connects afresh.
#[derive(Default)]
pub struct ConnectionProvider {
    clients: Mutex<HashMap<ConnectionKey, Weak<ClientInner>>>,
}

impl ConnectionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide provider.
    pub fn global() -> &'static ConnectionProvider {
        static GLOBAL: OnceLock<ConnectionProvider> = OnceLock::new();
        GLOBAL.get_or_init(ConnectionProvider::new)
    }

    /// The live client for `config`'s database, or a newly connected one.
    pub async fn get_or_connect(&self, config: StoreConfig) -> StoreResult<StoreClient> {
        self.get_or_build(config, StoreClient::connect).await
    }

    /// Like [`get_or_connect`](Self::get_or_connect) with a caller-supplied
    /// constructor, e.g. over a different backend.
    pub async fn get_or_build<F, Fut>(&self, config: StoreConfig, build: F) -> StoreResult<StoreClient>
    where
        F: FnOnce(StoreConfig) -> Fut,
        Fut: Future<Output = StoreResult<StoreClient>>,
    {
        let key = ConnectionKey::from(&config);
        if let Some(client) = self.lookup(&key) {
            return Ok(client);
        }

        // Built without the lock held; connecting may take a while.
        let built = build(config).await?;

        let mut clients = self.clients.lock();
        if let Some(existing) = clients.get(&key).and_then(StoreClient::upgrade) {
            debug!(host = %key.host, port = key.port, database = key.database, "reusing concurrently built client");
            return Ok(existing);
        }
        clients.retain(|_, weak| weak.strong_count() > 0);
        clients.insert(key, built.downgrade());
        Ok(built)
    }

    /// Number of live shared clients.
    pub fn live_clients(&self) -> usize {
        self.clients
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    fn lookup(&self, key: &ConnectionKey) -> Option<StoreClient> {
        self.clients.lock().get(key).and_then(StoreClient::upgrade)
    }
}
