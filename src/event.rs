//! Push-style notifications: key expiry and connection state changes.

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::warn;

/// Events published by a [`StoreClient`](crate::StoreClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StoreEvent {
    /// A key-expiry notification from the server.
    KeyExpired { channel: String, message: String },
    /// The transport lost its connection or failed to (re)connect.
    ConnectionFailed { message: String },
    /// The transport is reachable again after a failure.
    ConnectionRestored { message: String },
}

/// Fan-out of [`StoreEvent`]s to any number of subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, event: StoreEvent) -> usize {
        // Err only means nobody is listening.
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.subscribe_with(|| None)
    }

    /// Subscribe, delivering the event `initial` returns ahead of anything
    /// published later. `initial` runs after the receiver exists, so an event
    /// published concurrently may arrive twice but is never missed.
    pub fn subscribe_with(&self, initial: impl FnOnce() -> Option<StoreEvent>) -> EventSubscription {
        let receiver = self.sender.subscribe();
        EventSubscription {
            pending: initial(),
            receiver,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receives events published after it was created, preceded by at most one
/// replayed event. Dropping it unsubscribes.
pub struct EventSubscription {
    pending: Option<StoreEvent>,
    receiver: broadcast::Receiver<StoreEvent>,
}

impl EventSubscription {
    /// Next event, or `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        if let Some(event) = self.pending.take() {
            return Some(event);
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, dropping events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<StoreEvent> {
        if let Some(event) = self.pending.take() {
            return Some(event);
        }
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, dropping events");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

/// A callback registered with [`StoreClient::on_event`](crate::StoreClient::on_event).
/// The callback stops running when the handle is dropped or cancelled.
pub struct EventHandle {
    task: JoinHandle<()>,
}

impl EventHandle {
    pub(crate) fn spawn<F>(mut subscription: EventSubscription, callback: F) -> Self
    where
        F: Fn(StoreEvent) + Send + Sync + 'static,
    {
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                callback(event);
            }
        });
        Self { task }
    }

    pub fn cancel(self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for EventHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn failed(message: &str) -> StoreEvent {
        StoreEvent::ConnectionFailed {
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn subscribers_only_see_later_events() {
        let bus = EventBus::new(16);
        assert_eq!(bus.publish(failed("nobody home")), 0);

        let mut sub = bus.subscribe();
        assert_eq!(bus.publish(failed("one")), 1);
        assert_eq!(sub.recv().await, Some(failed("one")));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn initial_event_comes_first() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe_with(|| Some(failed("earlier")));
        bus.publish(failed("later"));
        assert_eq!(sub.recv().await, Some(failed("earlier")));
        assert_eq!(sub.try_recv(), Some(failed("later")));
        assert_eq!(sub.try_recv(), None);

        // Replayed even when the bus has already closed.
        let mut sub = bus.subscribe_with(|| Some(failed("last word")));
        drop(bus);
        assert_eq!(sub.recv().await, Some(failed("last word")));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_to_newest() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(failed(&i.to_string()));
        }
        assert_eq!(sub.recv().await, Some(failed("3")));
        assert_eq!(sub.recv().await, Some(failed("4")));
    }

    #[tokio::test]
    async fn closed_bus_ends_subscription() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();
        drop(bus);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn handle_runs_callback_until_dropped() {
        let bus = EventBus::new(4);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handle = EventHandle::spawn(bus.subscribe(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(failed("a"));
        bus.publish(failed("b"));
        while seen.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        assert!(handle.is_active());

        handle.cancel();
        while bus.subscriber_count() > 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(bus.publish(failed("c")), 0);
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = StoreEvent::KeyExpired {
            channel: "__keyevent@0__:expired".into(),
            message: "session:1".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"event":"key_expired","channel":"__keyevent@0__:expired","message":"session:1"}"#
        );
    }
}
