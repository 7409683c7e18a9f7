//! Deep-clone and structural-equality helpers over the boundary payload
//! type.
//!
//! Conduit payloads cross subsystem boundaries as [`serde_json::Value`],
//! which is already a plain tree of owned data. `Value::clone` is therefore
//! already a full deep clone and `Value`'s `PartialEq` is already full
//! structural equality; these helpers exist so call sites document intent
//! (and so a future boundary-type change has one place to update).

use serde_json::Value;

/// Deep-clone a payload value.
pub fn deep_clone(value: &Value) -> Value {
    value.clone()
}

/// Structural equality between two payload values.
pub fn structural_eq(a: &Value, b: &Value) -> bool {
    a == b
}
