#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-request** – correlated request/response on top of the event
//! kernel: `request`, `request_many`, `request_batch`, and the `respond`
//! builder.
//!
//! A request folds a fresh [`CorrelationId`] into the outgoing payload
//! under `__correlation_id` and waits on the private
//! `response:<correlation_id>` topic the responder replies on.
//! [`RequestEngine::respond`] installs a topic's middleware chain and
//! terminal handler (via [`conduit_middleware::MiddlewareManager`]) and
//! wires it up to reply on that topic automatically.

use std::collections::HashSet;
use std::sync::Arc;

use conduit_cache::{CacheEngine, CacheStrategy};
use conduit_interceptors::InterceptorPipeline;
use conduit_kernel::EventKernel;
use conduit_middleware::{MiddlewareManager, MiddlewareStage, ResponderHandler};
use conduit_types::{ConduitError, CorrelationId, CORRELATION_ID_FIELD};
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};

mod cancel;
mod options;

pub use cancel::CancelToken;
pub use options::{backoff_delay, CacheRequestOptions, Priority, RequestManyOptions, RequestOptions};

/// The correlated request/response engine.
pub struct RequestEngine {
    kernel: Arc<EventKernel>,
    interceptors: Arc<InterceptorPipeline>,
    middleware: Arc<MiddlewareManager>,
    cache: Arc<CacheEngine>,
    listening: Mutex<HashSet<String>>,
}

impl RequestEngine {
    /// Construct an engine over a shared kernel, interceptor pipeline,
    /// middleware manager, and cache engine. These are the same instances
    /// the owning `Bus` hands to its other subsystems.
    pub fn new(
        kernel: Arc<EventKernel>,
        interceptors: Arc<InterceptorPipeline>,
        middleware: Arc<MiddlewareManager>,
        cache: Arc<CacheEngine>,
    ) -> Self {
        Self {
            kernel,
            interceptors,
            middleware,
            cache,
            listening: Mutex::new(HashSet::new()),
        }
    }

    /// Begin installing a responder for `topic`. Chain
    /// [`RespondBuilder::middleware`] calls, then finish with
    /// [`RespondBuilder::handler`].
    pub fn respond<'a>(&'a self, topic: &str) -> RespondBuilder<'a> {
        RespondBuilder {
            engine: self,
            topic: topic.to_string(),
            stages: Vec::new(),
        }
    }

    async fn ensure_listening(&self, topic: &str) -> Result<(), ConduitError> {
        let mut guard = self.listening.lock().await;
        if guard.contains(topic) {
            return Ok(());
        }
        let middleware = self.middleware.clone();
        let kernel_for_response = self.kernel.clone();
        let topic_owned = topic.to_string();
        self.kernel
            .on(
                topic,
                Arc::new(move |payload: Value| {
                    let middleware = middleware.clone();
                    let kernel = kernel_for_response.clone();
                    let topic = topic_owned.clone();
                    Box::pin(async move {
                        Self::handle_incoming(middleware, kernel, topic, payload).await;
                    })
                }),
            )
            .await?;
        guard.insert(topic.to_string());
        Ok(())
    }

    async fn handle_incoming(
        middleware: Arc<MiddlewareManager>,
        kernel: Arc<EventKernel>,
        topic: String,
        mut payload: Value,
    ) {
        let correlation_id = payload
            .get(CORRELATION_ID_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(obj) = payload.as_object_mut() {
            obj.remove(CORRELATION_ID_FIELD);
        }
        let Some(correlation_id) = correlation_id else {
            tracing::warn!(topic = %topic, "dropping request with no correlation id");
            return;
        };
        let response_topic = format!("response:{correlation_id}");

        let results = middleware.dispatch(&topic, payload).await;
        for result in results {
            let wire = match result {
                Ok(value) => json!({ "ok": true, "value": value }),
                Err(err) => encode_error(&err),
            };
            if let Err(emit_err) = kernel.emit(&response_topic, wire).await {
                tracing::warn!(topic = %topic, error = %emit_err, "failed to publish response");
            }
        }
    }

    /// Issue a single correlated request on `topic`, retrying retryable
    /// failures up to `options.max_retries` times with exponential backoff.
    /// If `options.cache` is set, the request is resolved through the cache
    /// engine instead of always dispatching. `cancel`, if given, aborts the
    /// request immediately if already cancelled, or as soon as it fires
    /// while a dispatch is in flight.
    pub async fn request(
        &self,
        topic: &str,
        payload: Value,
        options: &RequestOptions,
        cancel: Option<&CancelToken>,
    ) -> Result<Value, ConduitError> {
        let base_payload = self.interceptors.run_request(payload).await?;

        let Some(cache_opts) = &options.cache else {
            return self.dispatch_with_retries(topic, base_payload, options, cancel).await;
        };

        let key = cache_key(topic, &base_payload);
        match cache_opts.strategy {
            CacheStrategy::CacheFirst => {
                if let Some(value) = self.cache.get(&key).await {
                    return Ok(value);
                }
                let value = self.dispatch_with_retries(topic, base_payload, options, cancel).await?;
                self.cache.set(key, conduit_types::deep_clone(&value), cache_opts.ttl).await;
                Ok(value)
            }
            CacheStrategy::NetworkFirst => {
                match self.dispatch_with_retries(topic, base_payload.clone(), options, cancel).await {
                    Ok(value) => {
                        self.cache.set(key, conduit_types::deep_clone(&value), cache_opts.ttl).await;
                        Ok(value)
                    }
                    Err(err) => match self.cache.get(&key).await {
                        Some(value) => {
                            tracing::warn!(topic, error = %err, "network-first request failed, serving cached value");
                            Ok(value)
                        }
                        None => Err(err),
                    },
                }
            }
            CacheStrategy::StaleWhileRevalidate => {
                if let Some(value) = self.cache.get(&key).await {
                    return Ok(value);
                }
                let value = self.dispatch_with_retries(topic, base_payload, options, cancel).await?;
                self.cache.set(key, conduit_types::deep_clone(&value), cache_opts.ttl).await;
                Ok(value)
            }
            CacheStrategy::CacheOnly => self.cache.get(&key).await.ok_or_else(|| {
                ConduitError::not_found(format!("no cached value for key '{key}' and strategy is cache-only"))
            }),
        }
    }

    async fn dispatch_with_retries(
        &self,
        topic: &str,
        payload: Value,
        options: &RequestOptions,
        cancel: Option<&CancelToken>,
    ) -> Result<Value, ConduitError> {
        let attempts = options.max_retries + 1;
        let mut last_err: Option<ConduitError> = None;

        for attempt in 1..=attempts {
            match self.attempt_once(topic, payload.clone(), options, cancel).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = err.is_retryable();
                    last_err = Some(err);
                    if attempt < attempts && retryable {
                        tokio::time::sleep(backoff_delay(attempt, options)).await;
                        continue;
                    }
                    break;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ConduitError::internal("request failed with no recorded error")))
    }

    async fn attempt_once(
        &self,
        topic: &str,
        mut outgoing: Value,
        options: &RequestOptions,
        cancel: Option<&CancelToken>,
    ) -> Result<Value, ConduitError> {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err(ConduitError::aborted(format!(
                    "request on '{topic}' aborted before dispatch"
                )));
            }
        }

        let correlation_id = CorrelationId::new();
        outgoing[CORRELATION_ID_FIELD] = json!(correlation_id.to_string());
        let response_topic = correlation_id.response_topic();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let sub_id = self
            .kernel
            .once(
                response_topic.as_str(),
                Arc::new(move |payload: Value| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        if let Some(sender) = tx.lock().await.take() {
                            let _ = sender.send(payload);
                        }
                    })
                }),
            )
            .await?;

        self.kernel.emit(topic, outgoing).await?;

        let wait_for_cancel = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => futures::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = rx => {
                match result {
                    Ok(response) => self.decode_wire(response).await,
                    Err(_) => Err(ConduitError::internal("response channel closed before a response arrived")),
                }
            }
            _ = tokio::time::sleep(options.timeout) => {
                self.kernel.off(response_topic.as_str(), sub_id).await;
                Err(ConduitError::timeout(format!(
                    "no response on '{topic}' within {:?}",
                    options.timeout
                )))
            }
            _ = wait_for_cancel => {
                self.kernel.off(response_topic.as_str(), sub_id).await;
                Err(ConduitError::aborted(format!(
                    "request on '{topic}' aborted before a response arrived"
                )))
            }
        }
    }

    /// Issue a request and collect every response that arrives within
    /// `options.timeout`, stopping early once `options.max_responses` is
    /// reached. Fails with [`ConduitError::Timeout`] if fewer than
    /// `options.min_responses` arrive.
    pub async fn request_many(
        &self,
        topic: &str,
        payload: Value,
        options: &RequestManyOptions,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<Value>, ConduitError> {
        let mut outgoing = self.interceptors.run_request(payload).await?;
        let correlation_id = CorrelationId::new();
        outgoing[CORRELATION_ID_FIELD] = json!(correlation_id.to_string());
        let response_topic = correlation_id.response_topic();

        let collected = Arc::new(Mutex::new(Vec::new()));
        let notify = Arc::new(Notify::new());
        let sub_id = self
            .kernel
            .on(response_topic.as_str(), {
                let collected = collected.clone();
                let notify = notify.clone();
                Arc::new(move |payload: Value| {
                    let collected = collected.clone();
                    let notify = notify.clone();
                    Box::pin(async move {
                        collected.lock().await.push(payload);
                        notify.notify_waiters();
                    })
                })
            })
            .await?;

        self.kernel.emit(topic, outgoing).await?;

        let deadline = tokio::time::Instant::now() + options.timeout;
        let mut cancelled = false;
        loop {
            if let Some(max) = options.max_responses {
                if collected.lock().await.len() >= max {
                    break;
                }
            }
            let wait_for_cancel = async {
                match cancel {
                    Some(token) => token.cancelled().await,
                    None => futures::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = notify.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => break,
                _ = wait_for_cancel => {
                    cancelled = true;
                    break;
                }
            }
        }

        self.kernel.off(response_topic.as_str(), sub_id).await;

        let raw = std::mem::take(&mut *collected.lock().await);
        let mut results = Vec::with_capacity(raw.len());
        for wire in raw {
            match self.decode_wire(wire).await {
                Ok(value) => results.push(value),
                Err(err) => tracing::warn!(topic, error = %err, "a responder in request_many returned an error; skipping it"),
            }
        }

        if results.len() < options.min_responses {
            return if cancelled {
                Err(ConduitError::aborted(format!(
                    "request_many on '{topic}' cancelled with only {} of the required {} responses collected",
                    results.len(),
                    options.min_responses
                )))
            } else {
                Err(ConduitError::timeout(format!(
                    "only {} of the required {} responses arrived within {:?}",
                    results.len(),
                    options.min_responses,
                    options.timeout
                )))
            };
        }
        Ok(results)
    }

    /// Fan out `payloads` as independent correlated requests on `topic`,
    /// running them concurrently. Each item's outcome is reported
    /// independently; one item failing does not affect the others.
    pub async fn request_batch(
        &self,
        topic: &str,
        payloads: Vec<Value>,
        options: &RequestOptions,
        cancel: Option<&CancelToken>,
    ) -> Vec<Result<Value, ConduitError>> {
        let futures = payloads.into_iter().enumerate().map(|(index, payload)| async move {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(ConduitError::service_unavailable(format!(
                        "batch item {index} cancelled before dispatch"
                    )));
                }
            }
            self.request(topic, payload, options, cancel).await
        });
        futures::future::join_all(futures).await
    }

    async fn decode_wire(&self, wire: Value) -> Result<Value, ConduitError> {
        let ok = wire.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if ok {
            let value = wire.get("value").cloned().unwrap_or(Value::Null);
            self.interceptors.run_response(value).await
        } else {
            Err(decode_error(&wire))
        }
    }
}

/// Derive a deterministic cache key from a topic and payload, so repeated
/// requests with the same topic+payload resolve to the same cache entry.
fn cache_key(topic: &str, payload: &Value) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    topic.hash(&mut hasher);
    payload.to_string().hash(&mut hasher);
    format!("request:{topic}:{:x}", hasher.finish())
}

/// Encode a [`ConduitError`] as a response payload's `error` object.
fn encode_error(err: &ConduitError) -> Value {
    json!({
        "ok": false,
        "error": {
            "kind": err.kind(),
            "message": err.message(),
            "details": err.details(),
        }
    })
}

fn decode_error(wire: &Value) -> ConduitError {
    let error = wire.get("error").cloned().unwrap_or(Value::Null);
    let kind = error.get("kind").and_then(Value::as_str).unwrap_or("internal");
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let details = error.get("details").cloned().filter(|v| !v.is_null());
    ConduitError::from_parts(kind, message, details)
}

/// Render a batch of per-item results as a single JSON array, substituting
/// `{"__error": <message>, "__index": <i>}` for failed items so a consumer
/// receiving the whole batch as one payload can distinguish successes from
/// failures without losing position information.
pub fn batch_results_to_json(results: &[Result<Value, ConduitError>]) -> Value {
    Value::Array(
        results
            .iter()
            .enumerate()
            .map(|(index, result)| match result {
                Ok(value) => value.clone(),
                Err(err) => json!({ "__error": err.message(), "__index": index }),
            })
            .collect(),
    )
}

/// Builder returned by [`RequestEngine::respond`].
pub struct RespondBuilder<'a> {
    engine: &'a RequestEngine,
    topic: String,
    stages: Vec<Arc<dyn MiddlewareStage>>,
}

impl<'a> RespondBuilder<'a> {
    /// Append a middleware stage to this topic's chain.
    pub fn middleware(mut self, stage: Arc<dyn MiddlewareStage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Install the terminal handler, freezing the middleware chain and
    /// subscribing to `topic` if this is the first responder registered
    /// for it.
    pub async fn handler(self, handler: Arc<dyn ResponderHandler>) -> Result<(), ConduitError> {
        for stage in self.stages {
            self.engine.middleware.add_stage(&self.topic, stage).await?;
        }
        self.engine.middleware.install_handler(&self.topic, handler).await;
        self.engine.ensure_listening(&self.topic).await
    }
}
