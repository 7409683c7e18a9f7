//! Namespaced view over an [`EventKernel`](crate::EventKernel).

use std::sync::Arc;

use conduit_types::ConduitError;
use serde_json::Value;

use crate::{EventKernel, Handler, SubscriptionId};

/// A view onto a shared kernel that transparently prefixes every topic with
/// `prefix:`, so a component can `on("created", ...)` without knowing or
/// colliding with any other component's topics.
#[derive(Clone)]
pub struct NamespaceView {
    kernel: Arc<EventKernel>,
    prefix: String,
}

impl NamespaceView {
    pub(crate) fn new(kernel: Arc<EventKernel>, prefix: String) -> Self {
        Self { kernel, prefix }
    }

    fn qualify(&self, topic: &str) -> String {
        format!("{}:{}", self.prefix, topic)
    }

    /// Register a persistent handler on `topic`, within this namespace.
    pub async fn on(&self, topic: &str, handler: Handler) -> Result<SubscriptionId, ConduitError> {
        self.kernel.on(&self.qualify(topic), handler).await
    }

    /// Register a one-shot handler on `topic`, within this namespace.
    pub async fn once(&self, topic: &str, handler: Handler) -> Result<SubscriptionId, ConduitError> {
        self.kernel.once(&self.qualify(topic), handler).await
    }

    /// Remove a subscription registered through this namespace.
    pub async fn off(&self, topic: &str, id: SubscriptionId) -> bool {
        self.kernel.off(&self.qualify(topic), id).await
    }

    /// Emit `payload` within this namespace.
    pub async fn emit(&self, topic: &str, payload: Value) -> Result<(), ConduitError> {
        self.kernel.emit(&self.qualify(topic), payload).await
    }

    /// Whether `topic` has listeners within this namespace.
    pub async fn has_listeners(&self, topic: &str) -> bool {
        self.kernel.has_listeners(&self.qualify(topic)).await
    }

    /// The namespace prefix this view applies.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}
