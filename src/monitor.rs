//! Connection state tracking and the heartbeat.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::{StoreError, StoreResult};
use crate::event::{EventBus, StoreEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No request has completed yet.
    Unknown,
    Up,
    Down,
}

struct MonitorState {
    link: LinkState,
    consecutive_failures: u64,
    last_failure: Option<String>,
}

/// Turns request outcomes into `ConnectionFailed` / `ConnectionRestored`
/// events.
///
/// Every reported failure publishes `ConnectionFailed`; only the first success
/// after a failure publishes `ConnectionRestored`.
pub struct ConnectionMonitor {
    endpoint: String,
    events: EventBus,
    state: Mutex<MonitorState>,
}

impl ConnectionMonitor {
    pub fn new(endpoint: impl Into<String>, events: EventBus) -> Self {
        Self {
            endpoint: endpoint.into(),
            events,
            state: Mutex::new(MonitorState {
                link: LinkState::Unknown,
                consecutive_failures: 0,
                last_failure: None,
            }),
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.state.lock().link
    }

    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Up
    }

    pub fn last_failure(&self) -> Option<String> {
        self.state.lock().last_failure.clone()
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.state.lock().consecutive_failures
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut state.link, LinkState::Up);
        state.consecutive_failures = 0;
        if previous != LinkState::Down {
            return;
        }
        drop(state);

        info!(endpoint = %self.endpoint, "connection restored");
        self.events.publish(StoreEvent::ConnectionRestored {
            message: format!("Connection restored : {}", self.endpoint),
        });
    }

    pub fn record_failure(&self, cause: &str) {
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut state.link, LinkState::Down);
        state.consecutive_failures += 1;
        state.last_failure = Some(cause.to_string());
        let failures = state.consecutive_failures;
        drop(state);

        if previous == LinkState::Down {
            debug!(endpoint = %self.endpoint, failures, cause, "connection still down");
        } else {
            warn!(endpoint = %self.endpoint, cause, "connection failed");
        }
        self.events.publish(StoreEvent::ConnectionFailed {
            message: format!("Connection failed : {cause}"),
        });
    }

    /// The `ConnectionFailed` event for the current outage, if the link is
    /// down. Lets a late subscriber learn about a failure that was published
    /// before it subscribed.
    pub fn failure_event(&self) -> Option<StoreEvent> {
        let state = self.state.lock();
        match (state.link, &state.last_failure) {
            (LinkState::Down, Some(cause)) => Some(StoreEvent::ConnectionFailed {
                message: format!("Connection failed : {cause}"),
            }),
            _ => None,
        }
    }

    /// Feed one request outcome in. Errors that say nothing about the
    /// transport (wrong type, bad argument) leave the state alone.
    pub fn observe<T>(&self, result: &StoreResult<T>) {
        match result {
            Ok(_) => self.record_success(),
            Err(err) if err.is_transport() => self.record_failure(&err.to_string()),
            Err(_) => {}
        }
    }
}

/// PING bounded by `timeout`. A PING that runs out of time resets the
/// backend's connection, so the next request reconnects instead of queueing
/// behind a stuck one.
pub async fn health_check(backend: &dyn Backend, timeout: Duration) -> StoreResult<()> {
    match time::timeout(timeout, backend.ping()).await {
        Ok(result) => result,
        Err(_) => {
            debug!(?timeout, "health check timed out, resetting connection");
            backend.reset().await;
            Err(StoreError::Timeout(timeout))
        }
    }
}

/// Health-check the backend every `interval`, feeding results into `monitor`.
/// Runs until the returned task is aborted.
pub fn spawn_heartbeat(
    backend: Arc<dyn Backend>,
    monitor: Arc<ConnectionMonitor>,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the caller has just checked.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let result = health_check(backend.as_ref(), timeout).await;
            monitor.observe(&result);
        }
    })
}
