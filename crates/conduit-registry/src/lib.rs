#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-registry** – a composed `Bus` instance and the process-wide
//! [`BusRegistry`] directory of named buses.
//!
//! A [`Bus`] wires every conduit subsystem together in dependency order:
//! kernel → interceptors → middleware → cache → request engine → state
//! registry → computed registry. Nothing outside this crate constructs a
//! `Bus` piecemeal; callers get one fully wired instance, whether standalone
//! via [`Bus::new`] or shared process-wide via [`BusRegistry`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use conduit_cache::{CacheConfig, CacheEngine, CacheStats};
use conduit_computed::ComputedRegistry;
use conduit_interceptors::InterceptorPipeline;
use conduit_kernel::{EventKernel, KernelStats};
use conduit_middleware::MiddlewareManager;
use conduit_request::RequestEngine;
use conduit_state::SharedStateRegistry;
use conduit_types::ConduitError;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

const MAX_BUS_NAME_LEN: usize = 255;

/// Configuration for a single [`Bus`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// The bus's registry key. Must be non-empty and at most
    /// [`MAX_BUS_NAME_LEN`] bytes.
    pub name: String,
    /// Per-topic subscriber cap passed to the event kernel. `None` uses the
    /// kernel's own default.
    pub max_listeners: Option<usize>,
    /// Configuration for this bus's response cache.
    pub cache: CacheConfig,
}

impl BusConfig {
    /// Construct a config for `name` with otherwise-default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_listeners: None,
            cache: CacheConfig::default(),
        }
    }

    fn validate(&self) -> Result<(), ConduitError> {
        if self.name.is_empty() || self.name.len() > MAX_BUS_NAME_LEN {
            return Err(ConduitError::bad_request(format!(
                "bus name length must be in 1..={MAX_BUS_NAME_LEN}, got {}",
                self.name.len()
            )));
        }
        Ok(())
    }
}

/// Aggregated point-in-time stats across a bus's subsystems.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BusStats {
    /// Event kernel counters.
    pub kernel: KernelStats,
    /// Response cache counters.
    pub cache: CacheStats,
}

/// A single, fully wired conduit bus instance.
pub struct Bus {
    name: String,
    kernel: Arc<EventKernel>,
    interceptors: Arc<InterceptorPipeline>,
    middleware: Arc<MiddlewareManager>,
    cache: Arc<CacheEngine>,
    request: Arc<RequestEngine>,
    state: Arc<SharedStateRegistry>,
    computed: Arc<ComputedRegistry>,
    destroyed: AtomicBool,
}

impl Bus {
    /// Wire up a fresh bus from `config`. Construction order is kernel →
    /// interceptors → middleware → cache → request engine → state registry
    /// → computed registry; each later subsystem is handed `Arc` clones of
    /// the earlier ones it depends on.
    pub fn new(config: BusConfig) -> Result<Arc<Self>, ConduitError> {
        config.validate()?;

        let kernel = match config.max_listeners {
            Some(max) => Arc::new(EventKernel::with_max_listeners(max)),
            None => Arc::new(EventKernel::new()),
        };
        let interceptors = Arc::new(InterceptorPipeline::new());
        let middleware = Arc::new(MiddlewareManager::new());
        let cache = CacheEngine::new(config.cache.clone());
        let request = Arc::new(RequestEngine::new(
            kernel.clone(),
            interceptors.clone(),
            middleware.clone(),
            cache.clone(),
        ));
        let state = Arc::new(SharedStateRegistry::new(kernel.clone()));
        let computed = Arc::new(ComputedRegistry::new(kernel.clone(), state.clone()));

        tracing::info!(bus = %config.name, "bus created");
        Ok(Arc::new(Self {
            name: config.name,
            kernel,
            interceptors,
            middleware,
            cache,
            request,
            state,
            computed,
            destroyed: AtomicBool::new(false),
        }))
    }

    /// This bus's registry key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The event kernel.
    pub fn kernel(&self) -> &Arc<EventKernel> {
        &self.kernel
    }

    /// The interceptor pipeline.
    pub fn interceptors(&self) -> &Arc<InterceptorPipeline> {
        &self.interceptors
    }

    /// The responder middleware manager.
    pub fn middleware(&self) -> &Arc<MiddlewareManager> {
        &self.middleware
    }

    /// The response cache engine.
    pub fn cache(&self) -> &Arc<CacheEngine> {
        &self.cache
    }

    /// The correlated request/response engine.
    pub fn request(&self) -> &Arc<RequestEngine> {
        &self.request
    }

    /// The shared-state registry.
    pub fn state(&self) -> &Arc<SharedStateRegistry> {
        &self.state
    }

    /// The computed-state registry.
    pub fn computed(&self) -> &Arc<ComputedRegistry> {
        &self.computed
    }

    /// Whether [`shutdown`](Self::shutdown) has already run on this bus.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Snapshot this bus's kernel and cache stats.
    pub async fn stats(&self) -> BusStats {
        BusStats {
            kernel: self.kernel.stats().await,
            cache: self.cache.stats().await,
        }
    }

    /// Tear the bus down in the reverse of construction order. Only the
    /// cache engine holds a background task (its sweep loop); everything
    /// else is purely reactive and needs no explicit stop signal. A
    /// destroyed bus keeps working for any `Arc` handle still held directly,
    /// but [`BusRegistry::cleanup`] will purge it on its next pass.
    pub async fn shutdown(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cache.shutdown().await;
        tracing::info!(bus = %self.name, "bus shut down");
    }
}

/// The process-wide directory of named [`Bus`] instances.
static REGISTRY: Lazy<RwLock<HashMap<String, Arc<Bus>>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Handle onto the process-wide bus directory. All methods operate against
/// the same single `static` table, so any number of `BusRegistry` values
/// observe the same buses.
#[derive(Debug, Default, Clone, Copy)]
pub struct BusRegistry;

impl BusRegistry {
    /// Create and register a bus under `config.name`. If a live (non-
    /// destroyed) bus is already registered under that name, returns it
    /// instead of creating a new one, logging a warning — a bus name is a
    /// singleton within a process. Destroyed entries are purged first so a
    /// torn-down name can be reused.
    pub async fn create(config: BusConfig) -> Result<Arc<Bus>, ConduitError> {
        Self::cleanup().await;

        let mut guard = REGISTRY.write().await;
        if let Some(existing) = guard.get(&config.name) {
            tracing::warn!(bus = %config.name, "bus already registered; returning the existing instance");
            return Ok(existing.clone());
        }

        let bus = Bus::new(config)?;
        guard.insert(bus.name().to_string(), bus.clone());
        Ok(bus)
    }

    /// Look up a registered bus by name.
    pub async fn get(name: &str) -> Option<Arc<Bus>> {
        REGISTRY.read().await.get(name).cloned()
    }

    /// Whether a bus is registered under `name`.
    pub async fn has(name: &str) -> bool {
        REGISTRY.read().await.contains_key(name)
    }

    /// Shut down and deregister the bus named `name`. Returns `true` if one
    /// was found.
    pub async fn remove(name: &str) -> bool {
        let bus = REGISTRY.write().await.remove(name);
        match bus {
            Some(bus) => {
                bus.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Shut down and deregister every bus.
    pub async fn clear() {
        let buses: Vec<Arc<Bus>> = REGISTRY.write().await.drain().map(|(_, bus)| bus).collect();
        for bus in buses {
            bus.shutdown().await;
        }
    }

    /// Every currently registered bus.
    pub async fn get_all() -> Vec<Arc<Bus>> {
        REGISTRY.read().await.values().cloned().collect()
    }

    /// Stats for every currently registered bus, keyed by name.
    pub async fn get_all_stats() -> HashMap<String, BusStats> {
        let buses: Vec<Arc<Bus>> = Self::get_all().await;
        let mut stats = HashMap::with_capacity(buses.len());
        for bus in buses {
            stats.insert(bus.name().to_string(), bus.stats().await);
        }
        stats
    }

    /// Remove any registered bus that has already been shut down, without
    /// touching live ones. Called automatically by [`create`](Self::create).
    pub async fn cleanup() {
        REGISTRY.write().await.retain(|_, bus| !bus.is_destroyed());
    }
}
