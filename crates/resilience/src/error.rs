//! Error types and transient-error classification.
//!
//! Operations supplied by callers fail with opaque boxed errors; this module
//! wraps them in [`ResilienceError`] and classifies them into an
//! [`ErrorClass`] that drives retry decisions. Classification matches error
//! categories first and falls back to common transient message patterns
//! (connection resets, 5xx gateway failures, throttling).

use std::time::Duration;

use thiserror::Error;

use crate::circuit_breaker::CircuitState;

/// Boxed error type for opaque operation failures.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the resilience layer.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// Circuit breaker is rejecting calls for this service.
    #[error("circuit for service `{service}` is {state}, failing fast")]
    CircuitOpen { service: String, state: CircuitState },

    /// A single attempt exceeded its deadline.
    #[error("operation timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// All retry attempts were used up; wraps the last underlying error.
    #[error("all {attempts} retry attempts exhausted")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<ResilienceError>,
    },

    /// Primary path and fallback both failed.
    #[error("service `{service}` degraded: primary and fallback both failed")]
    Degraded {
        service: String,
        #[source]
        source: BoxedError,
    },

    /// Service is marked unavailable by the degradation router.
    #[error("service `{service}` is marked unavailable")]
    Unavailable { service: String },

    /// The underlying operation failed.
    #[error("operation failed")]
    Operation {
        #[source]
        source: BoxedError,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled by caller")]
    Cancelled,

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// Cache encode/decode or crypto failure.
    #[error("cache error: {message}")]
    Cache { message: String },
}

/// Result alias used throughout the crate.
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Category assigned to an error for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection-level failure (reset, refused, DNS).
    Network,
    /// Deadline exceeded.
    Timeout,
    /// Upstream reported itself unavailable or overloaded.
    Unavailable,
    /// Gateway-class failure (502/504).
    Gateway,
    /// Throttled by the upstream.
    RateLimited,
    /// Circuit breaker rejection; never retried.
    CircuitOpen,
    /// Everything else; not retried.
    Other,
}

impl ErrorClass {
    /// Whether errors of this class are worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::Network
                | ErrorClass::Timeout
                | ErrorClass::Unavailable
                | ErrorClass::Gateway
                | ErrorClass::RateLimited
        )
    }
}

impl ResilienceError {
    /// Classify this error for retry purposes.
    pub fn class(&self) -> ErrorClass {
        match self {
            ResilienceError::Timeout { .. } => ErrorClass::Timeout,
            ResilienceError::CircuitOpen { .. } => ErrorClass::CircuitOpen,
            ResilienceError::Unavailable { .. } => ErrorClass::Unavailable,
            ResilienceError::Operation { source } => classify_message(&source.to_string()),
            ResilienceError::RetryExhausted { .. }
            | ResilienceError::Degraded { .. }
            | ResilienceError::Cancelled
            | ResilienceError::InvalidConfiguration { .. }
            | ResilienceError::Cache { .. } => ErrorClass::Other,
        }
    }

    /// Whether this error should be retried.
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        ResilienceError::InvalidConfiguration { message: message.into() }
    }

    pub(crate) fn cache(message: impl Into<String>) -> Self {
        ResilienceError::Cache { message: message.into() }
    }
}

/// Match an error message against common transient failure patterns.
pub fn classify_message(message: &str) -> ErrorClass {
    let msg = message.to_lowercase();

    const TIMEOUT: &[&str] = &["timeout", "timed out", "deadline exceeded"];
    const NETWORK: &[&str] = &[
        "connection refused",
        "connection reset",
        "broken pipe",
        "network",
        "dns",
        "econnreset",
        "econnrefused",
        "socket",
    ];
    const UNAVAILABLE: &[&str] = &["service unavailable", "unavailable", "overloaded", "503"];
    const GATEWAY: &[&str] = &["bad gateway", "gateway timeout", "502", "504"];
    const RATE_LIMITED: &[&str] = &["rate limit", "too many requests", "throttl", "429"];

    if TIMEOUT.iter().any(|p| msg.contains(p)) {
        ErrorClass::Timeout
    } else if NETWORK.iter().any(|p| msg.contains(p)) {
        ErrorClass::Network
    } else if UNAVAILABLE.iter().any(|p| msg.contains(p)) {
        ErrorClass::Unavailable
    } else if GATEWAY.iter().any(|p| msg.contains(p)) {
        ErrorClass::Gateway
    } else if RATE_LIMITED.iter().any(|p| msg.contains(p)) {
        ErrorClass::RateLimited
    } else {
        ErrorClass::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op_err(msg: &str) -> ResilienceError {
        ResilienceError::Operation { source: msg.to_string().into() }
    }

    #[test]
    fn timeout_is_retryable() {
        let err = ResilienceError::Timeout { elapsed: Duration::from_secs(5) };
        assert_eq!(err.class(), ErrorClass::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn circuit_open_is_not_retryable() {
        let err = ResilienceError::CircuitOpen {
            service: "llm".to_string(),
            state: CircuitState::Open,
        };
        assert_eq!(err.class(), ErrorClass::CircuitOpen);
        assert!(!err.is_retryable());
    }

    #[test]
    fn network_patterns_classify_as_network() {
        assert_eq!(op_err("connection reset by peer").class(), ErrorClass::Network);
        assert_eq!(op_err("ECONNREFUSED while dialing").class(), ErrorClass::Network);
        assert_eq!(op_err("dns lookup failed").class(), ErrorClass::Network);
    }

    #[test]
    fn gateway_and_unavailable_patterns() {
        assert_eq!(op_err("upstream returned 502 Bad Gateway").class(), ErrorClass::Gateway);
        assert_eq!(op_err("HTTP 503 Service Unavailable").class(), ErrorClass::Unavailable);
    }

    #[test]
    fn throttling_is_rate_limited() {
        assert_eq!(op_err("429 Too Many Requests").class(), ErrorClass::RateLimited);
        assert!(op_err("request was throttled").is_retryable());
    }

    #[test]
    fn unknown_messages_are_not_retryable() {
        let err = op_err("invalid dosage unit in request");
        assert_eq!(err.class(), ErrorClass::Other);
        assert!(!err.is_retryable());
    }

    #[test]
    fn retry_exhausted_preserves_source_chain() {
        let inner = op_err("connection reset");
        let err = ResilienceError::RetryExhausted { attempts: 5, source: Box::new(inner) };

        assert!(err.to_string().contains("5 retry attempts"));
        let source = std::error::Error::source(&err);
        assert!(source.is_some(), "Exhaustion should expose the last error");
        assert!(!err.is_retryable());
    }

    #[test]
    fn degraded_error_names_the_service() {
        let err = ResilienceError::Degraded {
            service: "knowledge-base".to_string(),
            source: "fallback store empty".to_string().into(),
        };
        assert!(err.to_string().contains("knowledge-base"));
    }

    #[test]
    fn cancelled_is_terminal() {
        assert!(!ResilienceError::Cancelled.is_retryable());
    }
}
