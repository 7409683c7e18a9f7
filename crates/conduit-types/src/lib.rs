#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-types** – Shared primitive types for the conduit communication
//! fabric.
//!
//! The crate is dependency-light and sits at the bottom of the crate graph
//! so every other conduit crate can depend on it without causing cycles. It
//! makes no assumptions about transport, persistence, or scheduling.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod error;
pub mod value;

pub use error::ConduitError;
pub use value::{deep_clone, structural_eq};

/// Maximum length, in bytes, of a topic string.
pub const MAX_TOPIC_LEN: usize = 255;

/// Maximum serialized payload size accepted by the kernel or cache, in
/// bytes. Larger payloads are rejected with [`ConduitError::PayloadTooLarge`].
pub const MAX_PAYLOAD_BYTES: usize = 1_048_576; // 1 MiB

/// Default bound on subscribers per topic before `on`/`once` starts warning
/// and, past a hard ceiling, refuses new registrations.
pub const DEFAULT_MAX_LISTENERS: usize = 100;

/// Reserved payload field carrying a request's [`CorrelationId`].
pub const CORRELATION_ID_FIELD: &str = "__correlation_id";

/// A validated topic name.
///
/// Topics are non-empty, at most [`MAX_TOPIC_LEN`] bytes, and carry no
/// leading or trailing whitespace. `namespace:child` is the conventional
/// join used by namespaced views and the reserved `response:`/`state:`
/// topic families.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Construct a topic, validating its shape.
    pub fn new(raw: impl Into<String>) -> Result<Self, ConduitError> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_TOPIC_LEN {
            return Err(ConduitError::bad_request(format!(
                "topic length must be in 1..={MAX_TOPIC_LEN}, got {}",
                raw.len()
            )));
        }
        if raw.trim() != raw {
            return Err(ConduitError::bad_request(
                "topic must not have leading or trailing whitespace",
            ));
        }
        Ok(Self(raw))
    }

    /// Join this topic as a namespace prefix for `child`, producing
    /// `self:child`.
    pub fn join(&self, child: &str) -> Result<Self, ConduitError> {
        Topic::new(format!("{}:{}", self.0, child))
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Strip a `prefix:` segment if present, returning the remainder.
    pub fn strip_prefix(&self, prefix: &str) -> Option<&str> {
        self.0
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix(':'))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Correlation identifier tying a request to its response(s).
///
/// Folded into outgoing request payloads under the reserved
/// `__correlation_id` field and used to derive the private
/// `response:<correlation_id>` topic a responder replies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh, random correlation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The private response topic this correlation id replies on.
    pub fn response_topic(&self) -> Topic {
        Topic(format!("response:{}", self.0))
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_rejects_empty_and_whitespace() {
        assert!(Topic::new("").is_err());
        assert!(Topic::new(" leading").is_err());
        assert!(Topic::new("trailing ").is_err());
        assert!(Topic::new("a").is_ok());
    }

    #[test]
    fn topic_rejects_oversize() {
        let long = "a".repeat(MAX_TOPIC_LEN + 1);
        assert!(Topic::new(long).is_err());
    }

    #[test]
    fn topic_join_and_strip_roundtrip() {
        let ns = Topic::new("orders").unwrap();
        let child = ns.join("created").unwrap();
        assert_eq!(child.as_str(), "orders:created");
        assert_eq!(child.strip_prefix("orders"), Some("created"));
        assert_eq!(child.strip_prefix("other"), None);
    }

    #[test]
    fn correlation_id_response_topic_is_namespaced() {
        let id = CorrelationId::new();
        let topic = id.response_topic();
        assert!(topic.as_str().starts_with("response:"));
    }
}
