//! Event publishing for observability consumers
//!
//! Every component owns an [`EventPublisher`] for its own event enum.
//! Delivery is synchronous and fire-and-forget: a panicking consumer is logged
//! and skipped, and never reaches the protected call path.

use parking_lot::RwLock;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// An event that can be filtered by kind
pub trait Event: Clone + fmt::Debug + Send + Sync + 'static {
    /// Field-less discriminant used for per-kind subscriptions
    type Kind: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ConsumerFn<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Consumer<E: Event> {
    id: SubscriptionId,
    kind: Option<E::Kind>,
    f: ConsumerFn<E>,
}

/// Fan-out of events to registered consumers
pub struct EventPublisher<E: Event> {
    source: String,
    consumers: RwLock<Vec<Consumer<E>>>,
    next_id: AtomicU64,
}

impl<E: Event> EventPublisher<E> {
    /// Create a publisher; `source` names the owning component in logs
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            consumers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Receive every event
    pub fn subscribe<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(f))
    }

    /// Receive only events of `kind`
    pub fn subscribe_kind<F>(&self, kind: E::Kind, f: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(f))
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut consumers = self.consumers.write();
        let before = consumers.len();
        consumers.retain(|c| c.id != id);
        consumers.len() != before
    }

    pub fn has_consumers(&self) -> bool {
        !self.consumers.read().is_empty()
    }

    /// Deliver `event` to every matching consumer
    pub(crate) fn publish(&self, event: E) {
        // Consumers run outside the lock so they may subscribe or unsubscribe
        let targets: Vec<ConsumerFn<E>> = {
            let consumers = self.consumers.read();
            if consumers.is_empty() {
                return;
            }
            let kind = event.kind();
            consumers
                .iter()
                .filter(|c| c.kind.is_none_or(|k| k == kind))
                .map(|c| Arc::clone(&c.f))
                .collect()
        };

        for consumer in targets {
            if catch_unwind(AssertUnwindSafe(|| consumer(&event))).is_err() {
                tracing::warn!(
                    source = %self.source,
                    kind = ?event.kind(),
                    "event consumer panicked; event dropped for this consumer"
                );
            }
        }
    }

    fn register(&self, kind: Option<E::Kind>, f: ConsumerFn<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.consumers.write().push(Consumer { id, kind, f });
        id
    }
}

impl<E: Event> fmt::Debug for EventPublisher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("source", &self.source)
            .field("consumers", &self.consumers.read().len())
            .finish()
    }
}
