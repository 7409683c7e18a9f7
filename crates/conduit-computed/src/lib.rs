#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-computed** – derived values computed from shared-state cells,
//! with automatic dependency tracking.
//!
//! A computed cell's derivation closure is handed a [`TrackingScope`]
//! instead of reaching for [`conduit_state::SharedStateRegistry`] directly;
//! every key the closure reads through the scope is recorded, so the
//! registry knows exactly which `state:<key>:changed` events should mark
//! the computed value stale. There is no monkey-patched global read-tracker
//! — tracking is explicit and scoped to a single recompute.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use conduit_kernel::{EventKernel, SubscriptionId};
use conduit_state::SharedStateRegistry;
use conduit_types::ConduitError;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

/// A boxed derivation future.
pub type ComputeFuture = Pin<Box<dyn Future<Output = Result<Value, ConduitError>> + Send>>;

/// A computed cell's derivation: given a [`TrackingScope`] to read
/// dependencies through, produce the derived value.
pub type ComputeFn = Arc<dyn Fn(TrackingScope) -> ComputeFuture + Send + Sync>;

/// Handed to a derivation closure so its dependency reads are recorded.
/// Reading the same key more than once within a single recompute records
/// it only once.
#[derive(Clone)]
pub struct TrackingScope {
    state: Arc<SharedStateRegistry>,
    recorded: Arc<Mutex<Vec<String>>>,
}

impl TrackingScope {
    fn new(state: Arc<SharedStateRegistry>) -> Self {
        Self {
            state,
            recorded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Read `key` from shared state, recording it as a dependency of the
    /// computed cell currently being derived.
    pub async fn read(&self, key: &str) -> Result<Option<Value>, ConduitError> {
        let mut recorded = self.recorded.lock().await;
        if !recorded.iter().any(|k| k == key) {
            recorded.push(key.to_string());
        }
        drop(recorded);
        Ok(self.state.get(key).await?.map(|snapshot| snapshot.value))
    }

    async fn into_recorded(self) -> Vec<String> {
        self.recorded.lock().await.clone()
    }
}

struct ComputedCell {
    compute: ComputeFn,
    cached_value: RwLock<Option<Value>>,
    dependencies: RwLock<HashMap<String, SubscriptionId>>,
    stale: AtomicBool,
    computing: AtomicBool,
    destroyed: AtomicBool,
    recompute_lock: Mutex<()>,
}

impl ComputedCell {
    fn new(compute: ComputeFn) -> Self {
        Self {
            compute,
            cached_value: RwLock::new(None),
            dependencies: RwLock::new(HashMap::new()),
            stale: AtomicBool::new(true),
            computing: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            recompute_lock: Mutex::new(()),
        }
    }
}

/// Registry of named computed cells.
pub struct ComputedRegistry {
    kernel: Arc<EventKernel>,
    state: Arc<SharedStateRegistry>,
    cells: RwLock<HashMap<String, Arc<ComputedCell>>>,
}

impl ComputedRegistry {
    /// Construct a registry deriving values from `state` and publishing
    /// staleness notifications on `kernel`.
    pub fn new(kernel: Arc<EventKernel>, state: Arc<SharedStateRegistry>) -> Self {
        Self {
            kernel,
            state,
            cells: RwLock::new(HashMap::new()),
        }
    }

    fn changed_topic(name: &str) -> String {
        format!("computed:{name}:changed")
    }

    /// Register `name` with derivation `compute`, and run it once
    /// immediately so the cell starts with a fresh value and a recorded
    /// dependency set.
    pub async fn create_computed(&self, name: &str, compute: ComputeFn) -> Result<(), ConduitError> {
        let cell = Arc::new(ComputedCell::new(compute));
        {
            let mut guard = self.cells.write().await;
            guard.insert(name.to_string(), cell.clone());
        }
        self.recompute(name, &cell).await?;
        Ok(())
    }

    /// Read the current value, recomputing first if stale.
    pub async fn get(&self, name: &str) -> Result<Value, ConduitError> {
        let cell = self.cell(name).await?;
        if !cell.stale.load(Ordering::Acquire) {
            if let Some(value) = cell.cached_value.read().await.clone() {
                return Ok(value);
            }
        }

        // Coalesce concurrent recompute requests: whoever gets the lock
        // first does the work, everyone else re-checks freshness after.
        let _guard = cell.recompute_lock.lock().await;
        if !cell.stale.load(Ordering::Acquire) {
            if let Some(value) = cell.cached_value.read().await.clone() {
                return Ok(value);
            }
        }
        drop(_guard);
        self.recompute(name, &cell).await
    }

    /// Mark `name` stale without recomputing it; the next [`get`](Self::get)
    /// call recomputes lazily. This is the explicit invalidation hook for
    /// callers that know a dependency changed through some channel other
    /// than shared state (e.g. an external event).
    pub async fn invalidate(&self, name: &str) -> Result<(), ConduitError> {
        let cell = self.cell(name).await?;
        cell.stale.store(true, Ordering::Release);
        Ok(())
    }

    /// Force an eager recompute right now, regardless of staleness.
    pub async fn refresh(&self, name: &str) -> Result<Value, ConduitError> {
        let cell = self.cell(name).await?;
        let _guard = cell.recompute_lock.lock().await;
        self.recompute(name, &cell).await
    }

    /// Register a listener on `name`'s computed value. The listener is
    /// invoked immediately with the cell's current value, then again every
    /// time a recompute produces a value structurally different from the
    /// one before it (a recompute that reproduces the same value is silent,
    /// mirroring [`conduit_state::SharedStateRegistry::subscribe`]'s
    /// change-only semantics).
    pub async fn subscribe(
        &self,
        name: &str,
        handler: conduit_kernel::Handler,
    ) -> Result<conduit_kernel::SubscriptionId, ConduitError> {
        let current = self.get(name).await?;
        let immediate = handler(current);
        tokio::spawn(immediate);
        self.kernel.on(&Self::changed_topic(name), handler).await
    }

    /// Tear a computed cell down: unsubscribe from every tracked
    /// dependency and tombstone it against future access.
    pub async fn destroy(&self, name: &str) -> Result<(), ConduitError> {
        let cell = self.cell(name).await?;
        cell.destroyed.store(true, Ordering::Release);
        let deps = cell.dependencies.write().await.drain().collect::<Vec<_>>();
        for (key, sub_id) in deps {
            self.kernel.off(&format!("state:{key}:changed"), sub_id).await;
        }
        self.cells.write().await.remove(name);
        Ok(())
    }

    async fn cell(&self, name: &str) -> Result<Arc<ComputedCell>, ConduitError> {
        self.cells
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ConduitError::not_found(format!("no computed cell named '{name}'")))
    }

    async fn recompute(&self, name: &str, cell: &Arc<ComputedCell>) -> Result<Value, ConduitError> {
        if cell.destroyed.load(Ordering::Acquire) {
            return Err(ConduitError::gone(format!("computed '{name}' has been destroyed")));
        }
        if cell
            .computing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ConduitError::conflict(format!(
                "computed '{name}' is already being computed; cyclic dependency?"
            )));
        }

        let scope = TrackingScope::new(self.state.clone());
        let result = (cell.compute)(scope.clone()).await;
        cell.computing.store(false, Ordering::Release);

        let value = result?;
        let new_deps = scope.into_recorded().await;

        let previous = cell.cached_value.write().await.replace(value.clone());
        cell.stale.store(false, Ordering::Release);
        self.resubscribe(name, cell, new_deps).await;

        let changed = match &previous {
            Some(previous) => !conduit_types::structural_eq(previous, &value),
            None => true,
        };
        if changed {
            if let Err(err) = self.kernel.emit(&Self::changed_topic(name), value.clone()).await {
                tracing::warn!(name, error = %err, "failed to publish computed-cell change");
            }
        }

        tracing::debug!(name, changed, "computed cell refreshed");
        Ok(value)
    }

    async fn resubscribe(&self, name: &str, cell: &Arc<ComputedCell>, new_deps: Vec<String>) {
        let mut existing = cell.dependencies.write().await;

        let stale_keys: Vec<String> = existing
            .keys()
            .filter(|key| !new_deps.contains(key))
            .cloned()
            .collect();
        for key in stale_keys {
            if let Some(sub_id) = existing.remove(&key) {
                self.kernel.off(&format!("state:{key}:changed"), sub_id).await;
            }
        }

        for key in new_deps {
            if existing.contains_key(&key) {
                continue;
            }
            let cell_for_handler = cell.clone();
            let name = name.to_string();
            let sub_id = self
                .kernel
                .on(
                    &format!("state:{key}:changed"),
                    Arc::new(move |_payload| {
                        let cell_for_handler = cell_for_handler.clone();
                        let name = name.clone();
                        Box::pin(async move {
                            cell_for_handler.stale.store(true, Ordering::Release);
                            tracing::trace!(computed = %name, "marked stale by dependency change");
                        })
                    }),
                )
                .await;
            if let Ok(sub_id) = sub_id {
                existing.insert(key, sub_id);
            }
        }
    }
}
