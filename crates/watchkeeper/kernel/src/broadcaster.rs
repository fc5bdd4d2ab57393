//! Lifecycle event fan-out.
//!
//! Each subscriber owns a bounded queue. Publishing never waits on a
//! subscriber: a queue that is closed or full drops that subscriber on the
//! spot. Within one subscriber events arrive in publish order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::json;
use tokio::sync::mpsc;
use watchkeeper_types::{EventType, LifecycleEvent};

use crate::config::BroadcasterConfig;

/// A live subscription. Dropping it unsubscribes on the next publish.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<LifecycleEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the broadcaster has dropped this
    /// subscriber.
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LifecycleEvent> {
        self.rx.try_recv().ok()
    }
}

pub struct EventBroadcaster {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<LifecycleEvent>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl EventBroadcaster {
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: config.subscriber_buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<LifecycleEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscriber. Its first event is always `connected`.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        let _ = tx.try_send(LifecycleEvent::new(
            EventType::Connected,
            json!({ "subscriber_id": id }),
        ));
        self.lock().insert(id, tx);
        tracing::debug!(subscriber_id = id, "Subscriber connected");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver `event` to every live subscriber and return how many
    /// accepted it.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        let targets: Vec<(u64, mpsc::Sender<LifecycleEvent>)> = self
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.lock();
            for id in &dead {
                subscribers.remove(id);
            }
            tracing::debug!(dropped = dead.len(), "Dropped unreachable subscribers");
        }

        tracing::trace!(event = %event.event_type, delivered, "Published lifecycle event");
        delivered
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}
