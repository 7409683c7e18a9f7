#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-kernel** – the topic-keyed event kernel at the center of the
//! conduit fabric.
//!
//! The kernel is plain fire-and-forget pub/sub: `on`/`once` register a
//! handler against a topic, `emit` invokes every live handler for that
//! topic with a cloned payload, and `off` tears a handler back down. It
//! knows nothing about request/response correlation, caching, or shared
//! state — those are built on top of it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use conduit_types::{ConduitError, Topic, DEFAULT_MAX_LISTENERS};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

mod namespace;
pub use namespace::NamespaceView;

/// A boxed, type-erased async handler future.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A subscriber callback: takes the emitted payload, returns a future that
/// completes when the subscriber has finished reacting.
pub type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Opaque handle identifying a single `on`/`once` registration, used to
/// unsubscribe it later via [`EventKernel::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
    once: bool,
}

/// Point-in-time counters for a kernel instance.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct KernelStats {
    /// Total successful `emit` calls (topic existed and validated).
    pub emits: u64,
    /// Total live `on`/`once` registrations across all topics.
    pub subscriptions: u64,
    /// Total `emit`/`on`/`once` calls rejected for failing validation.
    pub validation_failures: u64,
}

#[derive(Default)]
struct Counters {
    emits: AtomicU64,
    validation_failures: AtomicU64,
}

/// The event kernel: a topic-keyed subscriber registry.
pub struct EventKernel {
    subscribers: RwLock<HashMap<String, Vec<Subscription>>>,
    max_listeners: usize,
    counters: Counters,
}

impl EventKernel {
    /// Construct a kernel with the default per-topic listener bound
    /// ([`DEFAULT_MAX_LISTENERS`]).
    pub fn new() -> Self {
        Self::with_max_listeners(DEFAULT_MAX_LISTENERS)
    }

    /// Construct a kernel with an explicit per-topic listener bound.
    pub fn with_max_listeners(max_listeners: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            max_listeners,
            counters: Counters::default(),
        }
    }

    /// Register a persistent handler on `topic`.
    pub async fn on(
        &self,
        topic: &str,
        handler: Handler,
    ) -> Result<SubscriptionId, ConduitError> {
        self.subscribe(topic, handler, false).await
    }

    /// Register a handler on `topic` that automatically unsubscribes after
    /// its first invocation.
    pub async fn once(
        &self,
        topic: &str,
        handler: Handler,
    ) -> Result<SubscriptionId, ConduitError> {
        self.subscribe(topic, handler, true).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Handler,
        once: bool,
    ) -> Result<SubscriptionId, ConduitError> {
        let topic = self.validate_topic(topic)?;
        let mut guard = self.subscribers.write().await;
        let bucket = guard.entry(topic.as_str().to_string()).or_default();
        if bucket.len() >= self.max_listeners {
            tracing::warn!(topic = %topic, limit = self.max_listeners, "listener limit reached");
            return Err(ConduitError::internal(format!(
                "topic '{topic}' already has the maximum of {} listeners",
                self.max_listeners
            )));
        }
        let id = SubscriptionId(Uuid::new_v4());
        bucket.push(Subscription { id, handler, once });
        tracing::debug!(topic = %topic, %id, once, "listener registered");
        Ok(id)
    }

    /// Remove a single subscription by id. Returns `true` if a matching
    /// subscription was found on `topic`.
    pub async fn off(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut guard = self.subscribers.write().await;
        if let Some(bucket) = guard.get_mut(topic) {
            let before = bucket.len();
            bucket.retain(|sub| sub.id != id);
            let removed = bucket.len() != before;
            if bucket.is_empty() {
                guard.remove(topic);
            }
            removed
        } else {
            false
        }
    }

    /// Remove every listener on `topic`, or every listener on every topic
    /// if `topic` is `None`.
    pub async fn remove_all_listeners(&self, topic: Option<&str>) {
        let mut guard = self.subscribers.write().await;
        match topic {
            Some(topic) => {
                guard.remove(topic);
            }
            None => guard.clear(),
        }
    }

    /// Number of live listeners on `topic`.
    pub async fn listener_count(&self, topic: &str) -> usize {
        self.subscribers
            .read()
            .await
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Whether `topic` has at least one live listener.
    pub async fn has_listeners(&self, topic: &str) -> bool {
        self.listener_count(topic).await > 0
    }

    /// Every topic with at least one live listener.
    pub async fn event_names(&self) -> Vec<String> {
        self.subscribers.read().await.keys().cloned().collect()
    }

    /// Emit `payload` to every live listener on `topic`.
    ///
    /// Each handler receives its own deep-cloned copy of `payload` and runs
    /// to completion before the next handler starts; a handler that panics
    /// is caught and logged, never aborting the remaining fan-out. `once`
    /// listeners are removed after this call returns.
    pub async fn emit(&self, topic: &str, payload: Value) -> Result<(), ConduitError> {
        let topic_validated = self.validate_topic(topic)?;

        // Snapshot the current subscriber list so handler invocation never
        // holds the registry lock across an `.await`.
        let snapshot: Vec<(SubscriptionId, Handler, bool)> = {
            let guard = self.subscribers.read().await;
            guard
                .get(topic_validated.as_str())
                .map(|bucket| {
                    bucket
                        .iter()
                        .map(|sub| (sub.id, sub.handler.clone(), sub.once))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut fired_once = Vec::new();
        for (id, handler, once) in snapshot {
            let value = conduit_types::deep_clone(&payload);
            let task = tokio::spawn(async move { handler(value).await });
            if let Err(join_err) = task.await {
                tracing::warn!(topic = %topic_validated, %id, error = %join_err, "listener panicked");
            }
            if once {
                fired_once.push(id);
            }
        }

        if !fired_once.is_empty() {
            let mut guard = self.subscribers.write().await;
            if let Some(bucket) = guard.get_mut(topic_validated.as_str()) {
                bucket.retain(|sub| !fired_once.contains(&sub.id));
                if bucket.is_empty() {
                    guard.remove(topic_validated.as_str());
                }
            }
        }

        self.counters.emits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(topic = %topic_validated, "emitted");
        Ok(())
    }

    /// Create a namespaced view of this kernel: every topic passed through
    /// the view is transparently prefixed with `prefix:`.
    pub fn create_namespace(self: &Arc<Self>, prefix: impl Into<String>) -> NamespaceView {
        NamespaceView::new(Arc::clone(self), prefix.into())
    }

    /// Snapshot the kernel's counters.
    pub async fn stats(&self) -> KernelStats {
        let subscriptions = self
            .subscribers
            .read()
            .await
            .values()
            .map(Vec::len)
            .sum::<usize>() as u64;
        KernelStats {
            emits: self.counters.emits.load(Ordering::Relaxed),
            subscriptions,
            validation_failures: self.counters.validation_failures.load(Ordering::Relaxed),
        }
    }

    fn validate_topic(&self, topic: &str) -> Result<Topic, ConduitError> {
        Topic::new(topic).map_err(|err| {
            self.counters.validation_failures.fetch_add(1, Ordering::Relaxed);
            err
        })
    }
}

impl Default for EventKernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_payload| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn emit_invokes_all_listeners() {
        let kernel = EventKernel::new();
        let counter = Arc::new(AtomicUsize::new(0));
        kernel.on("orders:created", counting_handler(counter.clone())).await.unwrap();
        kernel.on("orders:created", counting_handler(counter.clone())).await.unwrap();

        kernel.emit("orders:created", serde_json::json!({"id": 1})).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn once_unsubscribes_after_first_emit() {
        let kernel = EventKernel::new();
        let counter = Arc::new(AtomicUsize::new(0));
        kernel.once("topic", counting_handler(counter.clone())).await.unwrap();

        kernel.emit("topic", serde_json::json!(null)).await.unwrap();
        kernel.emit("topic", serde_json::json!(null)).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!kernel.has_listeners("topic").await);
    }

    #[tokio::test]
    async fn off_removes_only_the_named_subscription() {
        let kernel = EventKernel::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = kernel.on("topic", counting_handler(counter.clone())).await.unwrap();
        kernel.on("topic", counting_handler(counter.clone())).await.unwrap();

        assert!(kernel.off("topic", id).await);
        kernel.emit("topic", serde_json::json!(null)).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn off_is_idempotent_for_unknown_ids() {
        let kernel = EventKernel::new();
        let bogus = SubscriptionId(Uuid::new_v4());
        assert!(!kernel.off("topic", bogus).await);
    }

    #[tokio::test]
    async fn emit_rejects_invalid_topics() {
        let kernel = EventKernel::new();
        let err = kernel.emit("", serde_json::json!(null)).await.unwrap_err();
        assert!(matches!(err, ConduitError::BadRequest { .. }));
        assert_eq!(kernel.stats().await.validation_failures, 1);
    }

    #[tokio::test]
    async fn listener_limit_is_enforced() {
        let kernel = EventKernel::with_max_listeners(1);
        let counter = Arc::new(AtomicUsize::new(0));
        kernel.on("topic", counting_handler(counter.clone())).await.unwrap();
        let err = kernel.on("topic", counting_handler(counter)).await.unwrap_err();
        assert!(matches!(err, ConduitError::Internal { .. }));
    }

    #[tokio::test]
    async fn handler_panic_does_not_abort_remaining_fanout() {
        let kernel = EventKernel::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let panicking: Handler = Arc::new(|_payload| Box::pin(async { panic!("boom") }));
        kernel.on("topic", panicking).await.unwrap();
        kernel.on("topic", counting_handler(counter.clone())).await.unwrap();

        kernel.emit("topic", serde_json::json!(null)).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn event_names_lists_only_live_topics() {
        let kernel = EventKernel::new();
        let counter = Arc::new(AtomicUsize::new(0));
        kernel.once("topic", counting_handler(counter)).await.unwrap();
        assert_eq!(kernel.event_names().await, vec!["topic".to_string()]);

        kernel.emit("topic", serde_json::json!(null)).await.unwrap();
        assert!(kernel.event_names().await.is_empty());
    }

    #[tokio::test]
    async fn remove_all_listeners_clears_everything() {
        let kernel = EventKernel::new();
        let notify = Arc::new(Notify::new());
        let notify_clone = notify.clone();
        let handler: Handler = Arc::new(move |_payload| {
            let notify = notify_clone.clone();
            Box::pin(async move {
                notify.notify_one();
            })
        });
        kernel.on("a", handler.clone()).await.unwrap();
        kernel.on("b", handler).await.unwrap();

        kernel.remove_all_listeners(None).await;

        assert!(kernel.event_names().await.is_empty());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_payload| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    proptest! {
        /// Calling `off` any number of extra times past the first is always
        /// safe and never removes a different, still-live subscription.
        #[test]
        fn off_is_idempotent_regardless_of_repeat_count(repeats in 0usize..10) {
            tokio_test::block_on(async {
                let kernel = EventKernel::new();
                let survivor_hits = Arc::new(AtomicUsize::new(0));
                let survivor = counting_handler(survivor_hits.clone());
                kernel.on("topic", survivor).await.unwrap();
                let id = kernel.on("topic", counting_handler(Arc::new(AtomicUsize::new(0)))).await.unwrap();

                assert!(kernel.off("topic", id).await);
                for _ in 0..repeats {
                    assert!(!kernel.off("topic", id).await);
                }

                kernel.emit("topic", serde_json::json!(null)).await.unwrap();
                assert_eq!(survivor_hits.load(Ordering::SeqCst), 1);
            });
        }
    }
}
