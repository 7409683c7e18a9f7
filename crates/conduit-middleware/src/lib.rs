#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-middleware** – the per-topic responder middleware chain.
//!
//! Unlike the global [interceptor pipeline](../conduit_interceptors), a
//! middleware chain is installed per responder topic and sits directly in
//! front of that topic's terminal handler. Each stage is handed an explicit
//! [`MiddlewareContext`] and must call exactly one of
//! [`MiddlewareContext::proceed`] or [`MiddlewareContext::cancel`]; a stage
//! that returns without deciding is treated as an implicit cancel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_types::ConduitError;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

enum Decision {
    Proceed(Value),
    Cancel(String),
}

/// Handed to a middleware stage so it can explicitly advance or halt the
/// chain. A stage must call exactly one of [`proceed`](Self::proceed) or
/// [`cancel`](Self::cancel); the second call (and any call after the first)
/// is ignored and logged, since the decision is already made.
#[derive(Clone)]
pub struct MiddlewareContext {
    decision: Arc<Mutex<Option<Decision>>>,
}

impl MiddlewareContext {
    fn new() -> Self {
        Self {
            decision: Arc::new(Mutex::new(None)),
        }
    }

    /// Allow the payload (possibly transformed) to continue to the next
    /// stage or the terminal handler.
    pub async fn proceed(&self, payload: Value) {
        self.decide(Decision::Proceed(payload)).await;
    }

    /// Halt the chain; `reason` surfaces to the requester as a `Forbidden`
    /// error.
    pub async fn cancel(&self, reason: impl Into<String>) {
        self.decide(Decision::Cancel(reason.into())).await;
    }

    async fn decide(&self, decision: Decision) {
        let mut slot = self.decision.lock().await;
        if slot.is_some() {
            tracing::warn!("middleware stage decided twice; ignoring the later call");
            return;
        }
        *slot = Some(decision);
    }

    async fn take(self) -> Option<Decision> {
        self.decision.lock().await.take()
    }
}

/// A single responder middleware stage.
#[async_trait]
pub trait MiddlewareStage: Send + Sync {
    /// React to `payload`, then call exactly one of `ctx.proceed` or
    /// `ctx.cancel`.
    async fn handle(&self, payload: Value, ctx: MiddlewareContext);
}

/// Blanket impl so a plain async closure can be registered as a stage.
#[async_trait]
impl<F, Fut> MiddlewareStage for F
where
    F: Fn(Value, MiddlewareContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn handle(&self, payload: Value, ctx: MiddlewareContext) {
        self(payload, ctx).await;
    }
}

/// The terminal handler installed for a topic, invoked only once every
/// stage in its chain has proceeded.
#[async_trait]
pub trait ResponderHandler: Send + Sync {
    /// Produce a response for `payload`.
    async fn respond(&self, payload: Value) -> Result<Value, ConduitError>;
}

#[async_trait]
impl<F, Fut> ResponderHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, ConduitError>> + Send,
{
    async fn respond(&self, payload: Value) -> Result<Value, ConduitError> {
        self(payload).await
    }
}

struct Chain {
    stages: Vec<Arc<dyn MiddlewareStage>>,
    handlers: Vec<Arc<dyn ResponderHandler>>,
    installed: bool,
}

impl Chain {
    fn new() -> Self {
        Self {
            stages: Vec::new(),
            handlers: Vec::new(),
            installed: false,
        }
    }
}

/// The per-topic middleware manager. One chain exists per topic that has
/// ever had a stage added or a handler installed.
#[derive(Default)]
pub struct MiddlewareManager {
    chains: RwLock<HashMap<String, Chain>>,
}

impl MiddlewareManager {
    /// Construct an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage to `topic`'s chain. Fails if the chain's terminal
    /// handler has already been installed (the chain is frozen).
    pub async fn add_stage(
        &self,
        topic: &str,
        stage: Arc<dyn MiddlewareStage>,
    ) -> Result<(), ConduitError> {
        let mut guard = self.chains.write().await;
        let chain = guard.entry(topic.to_string()).or_insert_with(Chain::new);
        if chain.installed {
            return Err(ConduitError::conflict(format!(
                "cannot add a middleware stage to '{topic}': its terminal handler is already installed"
            )));
        }
        chain.stages.push(stage);
        Ok(())
    }

    /// Install a terminal handler for `topic`, freezing the chain against
    /// further stage additions. Installing a second handler for the same
    /// topic is permitted: a warning is logged, and both handlers stay
    /// attached — each independently answers every request dispatched to
    /// `topic`, rather than the later one silently replacing the former.
    pub async fn install_handler(&self, topic: &str, handler: Arc<dyn ResponderHandler>) {
        let mut guard = self.chains.write().await;
        let chain = guard.entry(topic.to_string()).or_insert_with(Chain::new);
        if !chain.handlers.is_empty() {
            tracing::warn!(
                topic,
                existing = chain.handlers.len(),
                "another responder for this topic already exists; both remain installed"
            );
        }
        chain.handlers.push(handler);
        chain.installed = true;
    }

    /// Whether `topic` has at least one installed terminal handler.
    pub async fn has_handler(&self, topic: &str) -> bool {
        self.chains
            .read()
            .await
            .get(topic)
            .map(|chain| !chain.handlers.is_empty())
            .unwrap_or(false)
    }

    /// Run `payload` through `topic`'s shared middleware chain and, if
    /// every stage proceeds, every terminal handler installed for `topic`,
    /// independently. One entry is returned per installed handler, in
    /// installation order.
    pub async fn dispatch(&self, topic: &str, payload: Value) -> Vec<Result<Value, ConduitError>> {
        let (stages, handlers) = {
            let guard = self.chains.read().await;
            match guard.get(topic) {
                Some(chain) => (chain.stages.clone(), chain.handlers.clone()),
                None => (Vec::new(), Vec::new()),
            }
        };

        if handlers.is_empty() {
            return vec![Err(ConduitError::not_found(format!(
                "no responder installed for topic '{topic}'"
            )))];
        }

        let mut current = payload;
        for (index, stage) in stages.iter().enumerate() {
            let ctx = MiddlewareContext::new();
            stage.handle(current.clone(), ctx.clone()).await;
            match ctx.take().await {
                Some(Decision::Proceed(next)) => current = next,
                Some(Decision::Cancel(reason)) => {
                    tracing::debug!(topic, stage = index, reason = %reason, "middleware cancelled request");
                    return vec![Err(ConduitError::forbidden(reason))];
                }
                None => {
                    tracing::warn!(topic, stage = index, "middleware stage did not decide");
                    return vec![Err(ConduitError::forbidden(
                        "middleware stage returned without calling proceed or cancel",
                    ))];
                }
            }
        }

        let mut results = Vec::with_capacity(handlers.len());
        for handler in &handlers {
            results.push(handler.respond(current.clone()).await);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn dispatch_without_handler_is_not_found() {
        let manager = MiddlewareManager::new();
        let results = manager.dispatch("orders", json!({})).await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ConduitError::NotFound { .. })));
    }

    #[tokio::test]
    async fn handler_only_runs_after_every_stage_proceeds() {
        let manager = MiddlewareManager::new();
        manager
            .add_stage(
                "orders",
                Arc::new(|payload: Value, ctx: MiddlewareContext| async move {
                    let mut payload = payload;
                    payload["stamped"] = json!(true);
                    ctx.proceed(payload).await;
                }),
            )
            .await
            .unwrap();
        manager
            .install_handler(
                "orders",
                Arc::new(|payload: Value| async move { Ok(payload) }),
            )
            .await;

        let mut results = manager.dispatch("orders", json!({"id": 1})).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results.remove(0).unwrap(), json!({"id": 1, "stamped": true}));
    }

    #[tokio::test]
    async fn cancel_surfaces_as_forbidden() {
        let manager = MiddlewareManager::new();
        manager
            .add_stage(
                "orders",
                Arc::new(|_payload: Value, ctx: MiddlewareContext| async move {
                    ctx.cancel("not authorized").await;
                }),
            )
            .await
            .unwrap();
        manager
            .install_handler("orders", Arc::new(|payload: Value| async move { Ok(payload) }))
            .await;

        let mut results = manager.dispatch("orders", json!({})).await;
        assert_eq!(results.len(), 1);
        match results.remove(0).unwrap_err() {
            ConduitError::Forbidden { message, .. } => assert_eq!(message, "not authorized"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stage_that_does_not_decide_is_forbidden() {
        let manager = MiddlewareManager::new();
        manager
            .add_stage("orders", Arc::new(|_payload: Value, _ctx: MiddlewareContext| async move {}))
            .await
            .unwrap();
        manager
            .install_handler("orders", Arc::new(|payload: Value| async move { Ok(payload) }))
            .await;

        let results = manager.dispatch("orders", json!({})).await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ConduitError::Forbidden { .. })));
    }

    #[tokio::test]
    async fn installing_handler_freezes_the_chain() {
        let manager = MiddlewareManager::new();
        manager
            .install_handler("orders", Arc::new(|payload: Value| async move { Ok(payload) }))
            .await;

        let err = manager
            .add_stage("orders", Arc::new(|payload: Value, ctx: MiddlewareContext| async move {
                ctx.proceed(payload).await;
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, ConduitError::Conflict { .. }));
    }

    #[tokio::test]
    async fn a_second_installed_handler_stays_attached_alongside_the_first() {
        let manager = MiddlewareManager::new();
        manager
            .install_handler("orders", Arc::new(|_payload: Value| async move { Ok(json!("first")) }))
            .await;
        manager
            .install_handler("orders", Arc::new(|_payload: Value| async move { Ok(json!("second")) }))
            .await;

        let results = manager.dispatch("orders", json!({})).await;
        let values: Vec<Value> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![json!("first"), json!("second")]);
    }
}
