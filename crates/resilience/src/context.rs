//! Typed call context and criticality levels.
//!
//! Every operation routed through this crate carries a [`CallContext`]
//! describing how important the call is ([`Criticality`]), whether it is
//! urgent, and the identifiers needed for caching and logging. The context
//! also holds a [`CancellationToken`] so caller-initiated cancellation stops
//! retries and in-flight attempts promptly instead of merely capping waits.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Priority level attached to a service or cached value.
///
/// Drives TTL floors, retry budgets, per-attempt deadlines and cache
/// eviction weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Criticality {
    Low,
    Medium,
    High,
    Critical,
}

impl Criticality {
    /// Weight used in the cache eviction-priority formula.
    pub fn weight(self) -> u32 {
        match self {
            Criticality::Low => 1,
            Criticality::Medium => 2,
            Criticality::High => 3,
            Criticality::Critical => 4,
        }
    }

    /// Minimum cache TTL for values stored at this level.
    pub fn ttl_floor(self) -> Duration {
        match self {
            Criticality::Low => Duration::from_secs(5 * 60),
            Criticality::Medium => Duration::from_secs(15 * 60),
            Criticality::High => Duration::from_secs(30 * 60),
            Criticality::Critical => Duration::from_secs(60 * 60),
        }
    }

    /// Minimum retry attempts guaranteed at this level.
    pub fn attempt_floor(self) -> u32 {
        match self {
            Criticality::Low | Criticality::Medium => 0,
            Criticality::High => 4,
            Criticality::Critical => 5,
        }
    }
}

impl std::fmt::Display for Criticality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Criticality::Low => write!(f, "LOW"),
            Criticality::Medium => write!(f, "MEDIUM"),
            Criticality::High => write!(f, "HIGH"),
            Criticality::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Explicit, typed context passed alongside every operation.
///
/// Replaces ad-hoc inspection of request payloads: urgency, criticality and
/// identifiers travel as fields, never as duck-typed lookups.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Name of the logical operation, used for metric and log correlation.
    pub operation: String,
    /// Urgent calls get reduced latency budgets and may bypass open circuits.
    pub urgent: bool,
    /// Criticality of the call, defaulting to the service's level.
    pub criticality: Criticality,
    /// Subject identifier, when the call concerns a specific patient record.
    pub patient_id: Option<String>,
    /// Cache key for the result; `None` disables caching for this call.
    pub cache_key: Option<String>,
    /// Cancellation handle propagated through every layer.
    pub cancel: CancellationToken,
}

impl CallContext {
    /// Create a context for a named operation with default settings
    /// (non-urgent, MEDIUM criticality, no caching).
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            urgent: false,
            criticality: Criticality::Medium,
            patient_id: None,
            cache_key: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Mark the call urgent.
    pub fn urgent(mut self, urgent: bool) -> Self {
        self.urgent = urgent;
        self
    }

    /// Set the criticality level.
    pub fn criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    /// Attach a patient identifier.
    pub fn patient_id(mut self, id: impl Into<String>) -> Self {
        self.patient_id = Some(id.into());
        self
    }

    /// Enable caching of the result under the given key.
    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Per-attempt deadline for this call: 5s when urgent, otherwise scaled
    /// down as criticality rises so critical calls reach their fallback
    /// sooner.
    pub fn attempt_deadline(&self) -> Duration {
        if self.urgent {
            return Duration::from_secs(5);
        }
        match self.criticality {
            Criticality::Critical => Duration::from_secs(10),
            Criticality::High => Duration::from_secs(15),
            Criticality::Low | Criticality::Medium => Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criticality_ordering() {
        assert!(Criticality::Low < Criticality::Medium);
        assert!(Criticality::Medium < Criticality::High);
        assert!(Criticality::High < Criticality::Critical);
    }

    #[test]
    fn criticality_ttl_floors() {
        assert_eq!(Criticality::Low.ttl_floor(), Duration::from_secs(300));
        assert_eq!(Criticality::Medium.ttl_floor(), Duration::from_secs(900));
        assert_eq!(Criticality::High.ttl_floor(), Duration::from_secs(1800));
        assert_eq!(Criticality::Critical.ttl_floor(), Duration::from_secs(3600));
    }

    #[test]
    fn criticality_display_matches_levels() {
        assert_eq!(Criticality::Low.to_string(), "LOW");
        assert_eq!(Criticality::Critical.to_string(), "CRITICAL");
    }

    #[test]
    fn context_builder_defaults() {
        let ctx = CallContext::new("triage_lookup");
        assert_eq!(ctx.operation, "triage_lookup");
        assert!(!ctx.urgent);
        assert_eq!(ctx.criticality, Criticality::Medium);
        assert!(ctx.patient_id.is_none());
        assert!(ctx.cache_key.is_none());
        assert!(!ctx.cancel.is_cancelled());
    }

    #[test]
    fn context_builder_sets_fields() {
        let ctx = CallContext::new("dose_check")
            .urgent(true)
            .criticality(Criticality::Critical)
            .patient_id("p1")
            .cache_key("dose:p1");

        assert!(ctx.urgent);
        assert_eq!(ctx.criticality, Criticality::Critical);
        assert_eq!(ctx.patient_id.as_deref(), Some("p1"));
        assert_eq!(ctx.cache_key.as_deref(), Some("dose:p1"));
    }

    #[test]
    fn urgent_deadline_is_five_seconds() {
        let ctx = CallContext::new("op").urgent(true).criticality(Criticality::Low);
        assert_eq!(ctx.attempt_deadline(), Duration::from_secs(5));
    }

    #[test]
    fn deadline_scales_with_criticality() {
        let low = CallContext::new("op").criticality(Criticality::Low);
        let high = CallContext::new("op").criticality(Criticality::High);
        let critical = CallContext::new("op").criticality(Criticality::Critical);

        assert_eq!(low.attempt_deadline(), Duration::from_secs(30));
        assert_eq!(high.attempt_deadline(), Duration::from_secs(15));
        assert_eq!(critical.attempt_deadline(), Duration::from_secs(10));
    }

    #[test]
    fn external_cancellation_token_is_honored() {
        let token = CancellationToken::new();
        let ctx = CallContext::new("op").with_cancellation(token.clone());

        token.cancel();
        assert!(ctx.cancel.is_cancelled());
    }
}
