//! Typed, priority-aware publish-subscribe bus with a durable journal.
//!
//! Subscribers register a `can_handle` predicate, a priority, and a handler.
//! `publish` dispatches to matching subscribers in priority order (higher
//! first) and returns once every matching handler invocation has been
//! enqueued — handlers themselves run concurrently with the publisher so a
//! slow handler never stalls unrelated publishers.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use aegis_types::{Event, OrchestratorError};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinSet;

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A registered subscriber. `can_handle` gates which events reach `handle`;
/// `priority` orders concurrent subscribers for the same event (higher runs
/// first).
pub trait EventSubscriber: Send + Sync {
    fn id(&self) -> &str;
    fn priority(&self) -> i32 {
        0
    }
    fn can_handle(&self, event: &Event) -> bool;
    fn handle(&self, event: Event) -> HandlerFuture;
}

const JOURNAL_CAPACITY: usize = 10_000;
const BROADCAST_CAPACITY: usize = 1024;

struct Subscription {
    subscriber: Arc<dyn EventSubscriber>,
}

/// Process-scoped pub/sub bus. Lifecycle is bound to orchestrator start/stop.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

struct Inner {
    sender: broadcast::Sender<Event>,
    subscribers: RwLock<Vec<Subscription>>,
    journal: Mutex<VecDeque<Event>>,
    shutdown: AtomicBool,
    dispatched: AtomicU64,
    in_flight: Mutex<JoinSet<()>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                sender,
                subscribers: RwLock::new(Vec::new()),
                journal: Mutex::new(VecDeque::with_capacity(JOURNAL_CAPACITY)),
                shutdown: AtomicBool::new(false),
                dispatched: AtomicU64::new(0),
                in_flight: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Raw tap for consumers that just want the event stream (e.g. the CLI
    /// front end rendering progress as it happens).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.sender.subscribe()
    }

    /// Registers a structured subscriber. Subscribers are kept sorted by
    /// descending priority so ties are broken by registration order.
    pub async fn register(&self, subscriber: Arc<dyn EventSubscriber>) {
        let mut subs = self.inner.subscribers.write().await;
        subs.push(Subscription { subscriber });
        subs.sort_by(|a, b| b.subscriber.priority().cmp(&a.subscriber.priority()));
    }

    pub async fn unregister(&self, id: &str) {
        let mut subs = self.inner.subscribers.write().await;
        subs.retain(|s| s.subscriber.id() != id);
    }

    /// Appends to the journal and fans out to matching subscribers. Returns
    /// `BusShutDown` if `shutdown()` has already been called.
    pub async fn publish(&self, event: Event) -> Result<(), OrchestratorError> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(OrchestratorError::BusShutDown);
        }

        {
            let mut journal = self.inner.journal.lock().await;
            if journal.len() >= JOURNAL_CAPACITY {
                journal.pop_front();
            }
            journal.push_back(event.clone());
        }

        let _ = self.inner.sender.send(event.clone());

        let subs = self.inner.subscribers.read().await;
        let matching: Vec<Arc<dyn EventSubscriber>> = subs
            .iter()
            .filter(|s| s.subscriber.can_handle(&event))
            .map(|s| s.subscriber.clone())
            .collect();
        drop(subs);

        let mut in_flight = self.inner.in_flight.lock().await;
        for subscriber in matching {
            let event = event.clone();
            let inner = self.inner.clone();
            in_flight.spawn(async move {
                inner.dispatched.fetch_add(1, Ordering::Relaxed);
                subscriber.handle(event).await;
            });
        }

        Ok(())
    }

    /// Number of journaled events currently retained (bounded by capacity).
    pub async fn journal_len(&self) -> usize {
        self.inner.journal.lock().await.len()
    }

    pub async fn recent(&self, limit: usize) -> Vec<Event> {
        let journal = self.inner.journal.lock().await;
        journal.iter().rev().take(limit).cloned().collect()
    }

    /// Stops accepting new publishes, waits for in-flight dispatch to drain,
    /// then closes the journal.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let mut in_flight = self.inner.in_flight.lock().await;
        while in_flight.join_next().await.is_some() {}
        self.inner.journal.lock().await.clear();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_types::EventPriority;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct CountingSubscriber {
        id: String,
        priority: i32,
        count: Arc<AtomicUsize>,
    }

    impl EventSubscriber for CountingSubscriber {
        fn id(&self) -> &str {
            &self.id
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn can_handle(&self, event: &Event) -> bool {
            event.event_type == "test.event"
        }
        fn handle(&self, _event: Event) -> HandlerFuture {
            let count = self.count.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn publish_dispatches_to_matching_subscribers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.register(Arc::new(CountingSubscriber {
            id: "low".into(),
            priority: 0,
            count: count.clone(),
        }))
        .await;
        bus.register(Arc::new(CountingSubscriber {
            id: "high".into(),
            priority: 10,
            count: count.clone(),
        }))
        .await;

        bus.publish(Event::new(
            "test.event",
            EventPriority::Medium,
            "test",
            json!({}),
        ))
        .await
        .unwrap();
        bus.shutdown().await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn publish_after_shutdown_fails() {
        let bus = EventBus::new();
        bus.shutdown().await;
        let result = bus
            .publish(Event::new(
                "test.event",
                EventPriority::Low,
                "test",
                json!({}),
            ))
            .await;
        assert!(matches!(result, Err(OrchestratorError::BusShutDown)));
    }

    #[tokio::test]
    async fn unrelated_events_are_not_dispatched() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.register(Arc::new(CountingSubscriber {
            id: "sub".into(),
            priority: 0,
            count: count.clone(),
        }))
        .await;
        bus.publish(Event::new(
            "other.event",
            EventPriority::Low,
            "test",
            json!({}),
        ))
        .await
        .unwrap();
        bus.shutdown().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
