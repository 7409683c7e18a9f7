#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-state** – named, reactive shared-state cells.
//!
//! A cell is a `(value, sequence)` pair addressed by a string key.
//! `set` always wins; [`SharedStateRegistry::compare_and_set`] is the
//! optimistic-concurrency primitive cross-component writers use to detect
//! that they were working from a stale snapshot. Every accepted write
//! republishes the cell's key on the fabric's event kernel so any number of
//! holders converge on the same value without polling.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use conduit_kernel::EventKernel;
use conduit_types::ConduitError;
use serde_json::Value;
use tokio::sync::RwLock;

tokio::task_local! {
    static VISITING: RefCell<HashSet<String>>;
}

/// A cell's value together with the sequence number it was written at.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    /// The stored value.
    pub value: Value,
    /// Monotonically increasing per-cell sequence number.
    pub seq: u64,
}

struct Cell {
    value: RwLock<Value>,
    seq: AtomicU64,
    destroyed: AtomicBool,
}

impl Cell {
    fn new(value: Value) -> Self {
        Self {
            value: RwLock::new(value),
            seq: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
        }
    }
}

/// Registry of named shared-state cells, backed by the fabric's event
/// kernel for change notification.
pub struct SharedStateRegistry {
    kernel: Arc<EventKernel>,
    cells: RwLock<HashMap<String, Arc<Cell>>>,
}

impl SharedStateRegistry {
    /// Construct a registry that publishes change notifications on
    /// `kernel`.
    pub fn new(kernel: Arc<EventKernel>) -> Self {
        Self {
            kernel,
            cells: RwLock::new(HashMap::new()),
        }
    }

    fn changed_topic(key: &str) -> String {
        format!("state:{key}:changed")
    }

    fn removed_topic(key: &str) -> String {
        format!("state:{key}:removed")
    }

    fn destroyed_topic(key: &str) -> String {
        format!("state:{key}:destroyed")
    }

    /// Read the current snapshot for `key`, guarding against cyclic nested
    /// access (a handler invoked from within this same call chain reading
    /// the same key again).
    pub async fn get(&self, key: &str) -> Result<Option<StateSnapshot>, ConduitError> {
        self.with_cycle_guard(key, self.read_snapshot(key)).await
    }

    async fn read_snapshot(&self, key: &str) -> Result<Option<StateSnapshot>, ConduitError> {
        let guard = self.cells.read().await;
        match guard.get(key) {
            Some(cell) if cell.destroyed.load(Ordering::Acquire) => {
                Err(ConduitError::gone(format!("shared state '{key}' has been destroyed")))
            }
            Some(cell) => Ok(Some(StateSnapshot {
                value: cell.value.read().await.clone(),
                seq: cell.seq.load(Ordering::Acquire),
            })),
            None => Ok(None),
        }
    }

    /// Unconditionally write `value` to `key`, creating the cell if it
    /// doesn't exist yet. Returns the new sequence number.
    pub async fn set(&self, key: &str, value: Value) -> Result<u64, ConduitError> {
        self.with_cycle_guard(key, self.write(key, value, None)).await
    }

    /// Write `value` to `key` only if the cell's current sequence matches
    /// `expected_seq`, the standard optimistic-concurrency primitive for a
    /// holder that read a snapshot, computed a new value, and wants to
    /// apply it only if nobody else wrote in the meantime.
    pub async fn compare_and_set(
        &self,
        key: &str,
        expected_seq: u64,
        value: Value,
    ) -> Result<u64, ConduitError> {
        self.with_cycle_guard(key, self.write(key, value, Some(expected_seq))).await
    }

    async fn write(&self, key: &str, value: Value, expected_seq: Option<u64>) -> Result<u64, ConduitError> {
        let cell = {
            let mut guard = self.cells.write().await;
            guard
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Cell::new(Value::Null)))
                .clone()
        };

        if cell.destroyed.load(Ordering::Acquire) {
            return Err(ConduitError::gone(format!("shared state '{key}' has been destroyed")));
        }

        let mut value_guard = cell.value.write().await;
        let current_seq = cell.seq.load(Ordering::Acquire);
        if let Some(expected) = expected_seq {
            if expected != current_seq {
                return Err(ConduitError::conflict(format!(
                    "shared state '{key}' expected sequence {expected} but found {current_seq}"
                )));
            }
        }

        if conduit_types::structural_eq(&value, &value_guard) {
            return Ok(current_seq);
        }

        *value_guard = conduit_types::deep_clone(&value);
        let new_seq = cell.seq.fetch_add(1, Ordering::AcqRel) + 1;
        drop(value_guard);

        tracing::debug!(key, seq = new_seq, "shared state updated");
        let payload = serde_json::json!({ "value": value, "seq": new_seq });
        self.kernel.emit(&Self::changed_topic(key), payload).await?;
        Ok(new_seq)
    }

    /// Read-modify-write `key`: compute `updater(current_value)` and apply
    /// it via [`compare_and_set`](Self::compare_and_set), retrying on
    /// conflict up to `max_attempts` times.
    pub async fn update<F>(&self, key: &str, max_attempts: u32, mut updater: F) -> Result<u64, ConduitError>
    where
        F: FnMut(Option<Value>) -> Value,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let snapshot = self.get(key).await?;
            let (expected_seq, current_value) = match &snapshot {
                Some(s) => (Some(s.seq), Some(s.value.clone())),
                None => (None, None),
            };
            let next_value = updater(current_value);

            let result = match expected_seq {
                Some(seq) => self.compare_and_set(key, seq, next_value).await,
                None => self.set(key, next_value).await,
            };

            match result {
                Ok(seq) => return Ok(seq),
                Err(ConduitError::Conflict { .. }) if attempt < max_attempts => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Register a listener on `key`'s changes. The listener is invoked
    /// immediately with the cell's current snapshot (if any exists
    /// already), then again on every subsequent accepted write.
    pub async fn subscribe(
        &self,
        key: &str,
        handler: conduit_kernel::Handler,
    ) -> Result<conduit_kernel::SubscriptionId, ConduitError> {
        if let Some(snapshot) = self.read_snapshot(key).await? {
            let initial = serde_json::json!({ "value": snapshot.value, "seq": snapshot.seq });
            let immediate = handler(initial);
            tokio::spawn(immediate);
        }
        self.kernel.on(&Self::changed_topic(key), handler).await
    }

    /// Remove a cell entirely; a later `get`/`set` recreates it fresh.
    /// Publishes `state:<key>:removed`.
    pub async fn remove(&self, key: &str) -> Result<bool, ConduitError> {
        let removed = self.cells.write().await.remove(key).is_some();
        if removed {
            self.kernel
                .emit(&Self::removed_topic(key), serde_json::Value::Null)
                .await?;
        }
        Ok(removed)
    }

    /// Permanently tombstone a cell: every future `get`/`set`/`compare_and_set`
    /// against `key` fails with [`ConduitError::Gone`]. Publishes
    /// `state:<key>:destroyed`.
    pub async fn destroy(&self, key: &str) -> Result<(), ConduitError> {
        let cell = {
            let mut guard = self.cells.write().await;
            guard
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Cell::new(Value::Null)))
                .clone()
        };
        cell.destroyed.store(true, Ordering::Release);
        self.kernel
            .emit(&Self::destroyed_topic(key), serde_json::Value::Null)
            .await
    }

    async fn with_cycle_guard<T>(
        &self,
        key: &str,
        fut: impl Future<Output = Result<T, ConduitError>>,
    ) -> Result<T, ConduitError> {
        let in_scope = VISITING.try_with(|_| ()).is_ok();
        if in_scope {
            let cycle = VISITING.with(|set| {
                let mut set = set.borrow_mut();
                if set.contains(key) {
                    true
                } else {
                    set.insert(key.to_string());
                    false
                }
            });
            if cycle {
                return Err(ConduitError::bad_request(format!(
                    "cyclic shared-state access detected on key '{key}'"
                )));
            }
            let result = fut.await;
            VISITING.with(|set| {
                set.borrow_mut().remove(key);
            });
            result
        } else {
            let mut initial = HashSet::new();
            initial.insert(key.to_string());
            VISITING.scope(RefCell::new(initial), fut).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn registry() -> SharedStateRegistry {
        SharedStateRegistry::new(Arc::new(EventKernel::new()))
    }

    #[tokio::test]
    async fn get_on_unknown_key_is_none() {
        let registry = registry();
        assert_eq!(registry.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_then_get_round_trips_and_bumps_sequence() {
        let registry = registry();
        let seq1 = registry.set("count", serde_json::json!(1)).await.unwrap();
        let seq2 = registry.set("count", serde_json::json!(2)).await.unwrap();
        assert!(seq2 > seq1);

        let snapshot = registry.get("count").await.unwrap().unwrap();
        assert_eq!(snapshot.value, serde_json::json!(2));
        assert_eq!(snapshot.seq, seq2);
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_sequence() {
        let registry = registry();
        let seq = registry.set("count", serde_json::json!(1)).await.unwrap();
        registry.set("count", serde_json::json!(2)).await.unwrap();

        let err = registry
            .compare_and_set("count", seq, serde_json::json!(99))
            .await
            .unwrap_err();
        assert!(matches!(err, ConduitError::Conflict { .. }));
    }

    #[tokio::test]
    async fn update_applies_read_modify_write() {
        let registry = registry();
        registry.set("count", serde_json::json!(1)).await.unwrap();
        registry
            .update("count", 3, |current| {
                let n = current.and_then(|v| v.as_i64()).unwrap_or(0);
                serde_json::json!(n + 1)
            })
            .await
            .unwrap();

        assert_eq!(registry.get("count").await.unwrap().unwrap().value, serde_json::json!(2));
    }

    #[tokio::test]
    async fn subscribe_delivers_current_value_immediately() {
        let registry = registry();
        registry.set("count", serde_json::json!(1)).await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        registry
            .subscribe(
                "count",
                Arc::new(move |_payload| {
                    let hits = hits_clone.clone();
                    Box::pin(async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .await
            .unwrap();

        // immediate delivery is spawned, give it a turn to run
        tokio::task::yield_now().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        registry.set("count", serde_json::json!(2)).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn destroyed_cell_rejects_future_access() {
        let registry = registry();
        registry.set("count", serde_json::json!(1)).await.unwrap();
        registry.destroy("count").await.unwrap();

        assert!(matches!(registry.get("count").await, Err(ConduitError::Gone { .. })));
        assert!(matches!(
            registry.set("count", serde_json::json!(2)).await,
            Err(ConduitError::Gone { .. })
        ));
    }

    #[tokio::test]
    async fn removed_cell_can_be_recreated() {
        let registry = registry();
        registry.set("count", serde_json::json!(1)).await.unwrap();
        assert!(registry.remove("count").await.unwrap());
        assert_eq!(registry.get("count").await.unwrap(), None);

        registry.set("count", serde_json::json!(7)).await.unwrap();
        assert_eq!(registry.get("count").await.unwrap().unwrap().value, serde_json::json!(7));
    }

    #[tokio::test]
    async fn nested_reentrant_access_to_the_same_key_is_a_bad_request() {
        let registry = Arc::new(registry());
        registry.set("count", serde_json::json!(1)).await.unwrap();

        let inner = registry.clone();
        let result = registry
            .with_cycle_guard("count", async move {
                // Simulates a handler invoked synchronously within the same
                // logical access chain trying to read the same key again.
                inner.with_cycle_guard("count", async { Ok(()) }).await
            })
            .await;

        assert!(matches!(result, Err(ConduitError::BadRequest { .. })));
    }

    #[tokio::test]
    async fn a_set_structurally_equal_to_the_current_value_is_a_no_op() {
        let registry = registry();
        let seq = registry.set("count", serde_json::json!({"a": 1})).await.unwrap();
        let same_seq = registry.set("count", serde_json::json!({"a": 1})).await.unwrap();
        assert_eq!(same_seq, seq);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        registry
            .subscribe(
                "count",
                Arc::new(move |_payload| {
                    let hits = hits_clone.clone();
                    Box::pin(async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1); // the immediate delivery on subscribe

        registry.set("count", serde_json::json!({"a": 1})).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1); // no change, no notification

        registry.set("count", serde_json::json!({"a": 2})).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
