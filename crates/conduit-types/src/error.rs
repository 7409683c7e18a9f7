//! The conduit error taxonomy.
//!
//! Every fallible conduit operation returns `Result<T, ConduitError>`. The
//! variants mirror the minimum kind set a request/response fabric needs to
//! distinguish caller mistakes from transient backend trouble, so retry
//! logic in the request engine can consult [`ConduitError::is_retryable`]
//! instead of pattern-matching on messages.

use serde_json::Value;
use thiserror::Error;

/// The conduit error taxonomy.
#[derive(Debug, Error, Clone)]
pub enum ConduitError {
    /// The caller's request was malformed (bad topic, oversized payload
    /// shape, invalid options).
    #[error("bad request: {message}")]
    BadRequest {
        /// Human-readable explanation.
        message: String,
        /// Structured detail bag, e.g. which field failed validation.
        details: Option<Value>,
    },
    /// No responder is registered for the requested topic.
    #[error("not found: {message}")]
    NotFound {
        /// Human-readable explanation.
        message: String,
        /// Structured detail bag.
        details: Option<Value>,
    },
    /// A middleware stage or interceptor refused the operation.
    #[error("forbidden: {message}")]
    Forbidden {
        /// Human-readable explanation.
        message: String,
        /// Structured detail bag.
        details: Option<Value>,
    },
    /// The operation did not complete within its deadline.
    #[error("timeout: {message}")]
    Timeout {
        /// Human-readable explanation.
        message: String,
        /// Structured detail bag.
        details: Option<Value>,
    },
    /// The operation conflicts with concurrent state (e.g. a stale sequence
    /// number on a shared state write).
    #[error("conflict: {message}")]
    Conflict {
        /// Human-readable explanation.
        message: String,
        /// Structured detail bag.
        details: Option<Value>,
    },
    /// A payload exceeded the configured size limit.
    #[error("payload too large: {message}")]
    PayloadTooLarge {
        /// Human-readable explanation.
        message: String,
        /// Structured detail bag.
        details: Option<Value>,
    },
    /// The caller or topic has exceeded a rate limit.
    #[error("too many requests: {message}")]
    TooManyRequests {
        /// Human-readable explanation.
        message: String,
        /// Structured detail bag.
        details: Option<Value>,
    },
    /// The payload was well-formed but semantically invalid.
    #[error("unprocessable entity: {message}")]
    UnprocessableEntity {
        /// Human-readable explanation.
        message: String,
        /// Structured detail bag.
        details: Option<Value>,
    },
    /// The targeted resource (cell, computed value, cache entry) has been
    /// destroyed and will never come back.
    #[error("gone: {message}")]
    Gone {
        /// Human-readable explanation.
        message: String,
        /// Structured detail bag.
        details: Option<Value>,
    },
    /// The subsystem is temporarily unable to serve the request (e.g. the
    /// bus is shutting down).
    #[error("service unavailable: {message}")]
    ServiceUnavailable {
        /// Human-readable explanation.
        message: String,
        /// Structured detail bag.
        details: Option<Value>,
    },
    /// An unexpected internal fault. Never constructed from caller input;
    /// other subsystems wrap unanticipated failures here rather than
    /// panicking.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable explanation.
        message: String,
        /// Structured detail bag.
        details: Option<Value>,
    },
    /// The caller's cancellation handle fired before a terminal outcome was
    /// reached. Distinct from [`Self::Timeout`]: the caller asked to stop,
    /// the deadline didn't.
    #[error("aborted: {message}")]
    Aborted {
        /// Human-readable explanation.
        message: String,
        /// Structured detail bag.
        details: Option<Value>,
    },
}

macro_rules! ctor {
    ($name:ident => $variant:ident) => {
        #[doc = concat!("Construct a `", stringify!($variant), "` error with no detail bag.")]
        pub fn $name(message: impl Into<String>) -> Self {
            Self::$variant {
                message: message.into(),
                details: None,
            }
        }
    };
}

impl ConduitError {
    ctor!(bad_request => BadRequest);
    ctor!(not_found => NotFound);
    ctor!(forbidden => Forbidden);
    ctor!(timeout => Timeout);
    ctor!(conflict => Conflict);
    ctor!(payload_too_large => PayloadTooLarge);
    ctor!(too_many_requests => TooManyRequests);
    ctor!(unprocessable_entity => UnprocessableEntity);
    ctor!(gone => Gone);
    ctor!(service_unavailable => ServiceUnavailable);
    ctor!(internal => Internal);
    ctor!(aborted => Aborted);

    /// Attach a structured detail bag to an existing error.
    pub fn with_details(mut self, value: Value) -> Self {
        let slot = match &mut self {
            Self::BadRequest { details, .. }
            | Self::NotFound { details, .. }
            | Self::Forbidden { details, .. }
            | Self::Timeout { details, .. }
            | Self::Conflict { details, .. }
            | Self::PayloadTooLarge { details, .. }
            | Self::TooManyRequests { details, .. }
            | Self::UnprocessableEntity { details, .. }
            | Self::Gone { details, .. }
            | Self::ServiceUnavailable { details, .. }
            | Self::Internal { details, .. }
            | Self::Aborted { details, .. } => details,
        };
        *slot = Some(value);
        self
    }

    /// Whether a caller may reasonably retry the operation that produced
    /// this error. Transient backend conditions (timeouts, rate limiting,
    /// temporary unavailability, unexpected internal faults) are retryable;
    /// caller mistakes, permanent resource states, and deliberate
    /// cancellation are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::TooManyRequests { .. }
                | Self::ServiceUnavailable { .. }
                | Self::Internal { .. }
        )
    }

    /// The error's kind as a stable wire identifier, for encoding a response
    /// error across a request/response round trip.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "bad_request",
            Self::NotFound { .. } => "not_found",
            Self::Forbidden { .. } => "forbidden",
            Self::Timeout { .. } => "timeout",
            Self::Conflict { .. } => "conflict",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::TooManyRequests { .. } => "too_many_requests",
            Self::UnprocessableEntity { .. } => "unprocessable_entity",
            Self::Gone { .. } => "gone",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Internal { .. } => "internal",
            Self::Aborted { .. } => "aborted",
        }
    }

    /// The error's human-readable message.
    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest { message, .. }
            | Self::NotFound { message, .. }
            | Self::Forbidden { message, .. }
            | Self::Timeout { message, .. }
            | Self::Conflict { message, .. }
            | Self::PayloadTooLarge { message, .. }
            | Self::TooManyRequests { message, .. }
            | Self::UnprocessableEntity { message, .. }
            | Self::Gone { message, .. }
            | Self::ServiceUnavailable { message, .. }
            | Self::Internal { message, .. }
            | Self::Aborted { message, .. } => message,
        }
    }

    /// The error's structured detail bag, if any.
    pub fn details(&self) -> Option<&Value> {
        match self {
            Self::BadRequest { details, .. }
            | Self::NotFound { details, .. }
            | Self::Forbidden { details, .. }
            | Self::Timeout { details, .. }
            | Self::Conflict { details, .. }
            | Self::PayloadTooLarge { details, .. }
            | Self::TooManyRequests { details, .. }
            | Self::UnprocessableEntity { details, .. }
            | Self::Gone { details, .. }
            | Self::ServiceUnavailable { details, .. }
            | Self::Internal { details, .. }
            | Self::Aborted { details, .. } => details.as_ref(),
        }
    }

    /// Reconstruct an error from its wire kind identifier (see
    /// [`kind`](Self::kind)). Unknown kinds fall back to `Internal` so a
    /// version skew between requester and responder never panics.
    pub fn from_parts(kind: &str, message: String, details: Option<Value>) -> Self {
        let ctor = match kind {
            "bad_request" => Self::BadRequest,
            "not_found" => Self::NotFound,
            "forbidden" => Self::Forbidden,
            "timeout" => Self::Timeout,
            "conflict" => Self::Conflict,
            "payload_too_large" => Self::PayloadTooLarge,
            "too_many_requests" => Self::TooManyRequests,
            "unprocessable_entity" => Self::UnprocessableEntity,
            "gone" => Self::Gone,
            "service_unavailable" => Self::ServiceUnavailable,
            "aborted" => Self::Aborted,
            _ => Self::Internal,
        };
        ctor { message, details }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_are_exactly_transient_ones() {
        assert!(ConduitError::timeout("t").is_retryable());
        assert!(ConduitError::too_many_requests("t").is_retryable());
        assert!(ConduitError::service_unavailable("t").is_retryable());
        assert!(ConduitError::internal("t").is_retryable());
        assert!(!ConduitError::bad_request("t").is_retryable());
        assert!(!ConduitError::not_found("t").is_retryable());
        assert!(!ConduitError::forbidden("t").is_retryable());
        assert!(!ConduitError::conflict("t").is_retryable());
        assert!(!ConduitError::gone("t").is_retryable());
        assert!(!ConduitError::aborted("t").is_retryable());
    }

    #[test]
    fn with_details_attaches_bag() {
        let err = ConduitError::bad_request("bad topic").with_details(serde_json::json!({
            "field": "topic",
        }));
        match err {
            ConduitError::BadRequest { details, .. } => assert!(details.is_some()),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn kind_and_from_parts_round_trip() {
        let original = ConduitError::conflict("stale write").with_details(serde_json::json!({"seq": 3}));
        let rebuilt = ConduitError::from_parts(original.kind(), original.message().to_string(), original.details().cloned());
        assert_eq!(rebuilt.kind(), "conflict");
        assert_eq!(rebuilt.message(), "stale write");
        assert_eq!(rebuilt.details(), original.details());
    }

    #[test]
    fn unknown_kind_falls_back_to_internal() {
        let rebuilt = ConduitError::from_parts("something_new", "oops".to_string(), None);
        assert!(matches!(rebuilt, ConduitError::Internal { .. }));
    }
}
