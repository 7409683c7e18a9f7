#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-interceptors** – the ordered request/response transform
//! pipeline sitting in front of the request/response engine.
//!
//! Interceptors see an owned, already deep-cloned payload and return either
//! `Ok(None)` ("no change, pass the existing value on"), `Ok(Some(value))`
//! ("replace the payload with this value"), or `Err(_)` ("abort the whole
//! pipeline and surface this error to the caller"). Request interceptors
//! and response interceptors run in two independently ordered chains.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use conduit_types::ConduitError;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A single pipeline stage.
///
/// Implementors transform (or validate, or reject) a payload flowing
/// through the request or response pipeline.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Inspect or transform `payload`.
    ///
    /// `Ok(None)` leaves the payload unchanged; `Ok(Some(next))` replaces
    /// it for the remaining stages; `Err(_)` aborts the pipeline.
    async fn intercept(&self, payload: Value) -> Result<Option<Value>, ConduitError>;
}

/// Blanket impl so a plain async closure can be used as an interceptor
/// without a bespoke struct.
#[async_trait]
impl<F, Fut> Interceptor for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Option<Value>, ConduitError>> + Send,
{
    async fn intercept(&self, payload: Value) -> Result<Option<Value>, ConduitError> {
        self(payload).await
    }
}

/// Which direction a stage was registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Runs before a request leaves the engine (or before `respond`'s
    /// handler sees it).
    Request,
    /// Runs before a response is delivered back to the caller.
    Response,
}

/// Opaque handle identifying a single registered interceptor, returned by
/// [`InterceptorPipeline::add`] and used to unregister it later via
/// [`InterceptorPipeline::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorId(Uuid);

impl fmt::Display for InterceptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

struct Registration {
    id: InterceptorId,
    interceptor: Arc<dyn Interceptor>,
}

/// An ordered request pipeline and an ordered response pipeline.
#[derive(Default)]
pub struct InterceptorPipeline {
    request: RwLock<Vec<Registration>>,
    response: RwLock<Vec<Registration>>,
    destroyed: AtomicBool,
}

impl InterceptorPipeline {
    /// Construct an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage to the chain for `direction`. Stages run in
    /// registration order. Returns a handle that can later be passed to
    /// [`remove`](Self::remove).
    pub async fn add(&self, direction: Direction, interceptor: Arc<dyn Interceptor>) -> InterceptorId {
        let id = InterceptorId(Uuid::new_v4());
        let chain = match direction {
            Direction::Request => &self.request,
            Direction::Response => &self.response,
        };
        chain.write().await.push(Registration { id, interceptor });
        id
    }

    /// Remove a single interceptor by the handle [`add`](Self::add)
    /// returned for it. Returns `true` if it was found in `direction`'s
    /// chain.
    pub async fn remove(&self, direction: Direction, id: InterceptorId) -> bool {
        let chain = match direction {
            Direction::Request => &self.request,
            Direction::Response => &self.response,
        };
        let mut guard = chain.write().await;
        let before = guard.len();
        guard.retain(|reg| reg.id != id);
        guard.len() != before
    }

    /// Remove every stage from `direction`'s chain, leaving the other
    /// chain untouched.
    pub async fn clear(&self, direction: Direction) {
        let chain = match direction {
            Direction::Request => &self.request,
            Direction::Response => &self.response,
        };
        chain.write().await.clear();
    }

    /// Tear the pipeline down entirely: clear both chains and mark it
    /// destroyed, so calling code can stop routing payloads through it.
    pub async fn destroy(&self) {
        self.request.write().await.clear();
        self.response.write().await.clear();
        self.destroyed.store(true, Ordering::Release);
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Run `payload` through the request chain.
    pub async fn run_request(&self, payload: Value) -> Result<Value, ConduitError> {
        Self::run_chain(&self.request, payload).await
    }

    /// Run `payload` through the response chain.
    pub async fn run_response(&self, payload: Value) -> Result<Value, ConduitError> {
        Self::run_chain(&self.response, payload).await
    }

    async fn run_chain(chain: &RwLock<Vec<Registration>>, payload: Value) -> Result<Value, ConduitError> {
        let stages: Vec<Arc<dyn Interceptor>> = chain
            .read()
            .await
            .iter()
            .map(|reg| reg.interceptor.clone())
            .collect();
        let mut current = payload;
        for (index, stage) in stages.iter().enumerate() {
            match stage.intercept(current.clone()).await {
                Ok(Some(next)) => current = next,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(stage = index, error = %err, "interceptor aborted pipeline");
                    return Err(err);
                }
            }
        }
        Ok(current)
    }

    /// Number of stages currently registered for `direction`.
    pub async fn len(&self, direction: Direction) -> usize {
        match direction {
            Direction::Request => self.request.read().await.len(),
            Direction::Response => self.response.read().await.len(),
        }
    }

    /// Whether there are no stages registered for `direction`.
    pub async fn is_empty(&self, direction: Direction) -> bool {
        self.len(direction).await == 0
    }
}
