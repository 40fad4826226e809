//! Resilience layer for pediatric guidance services.
//!
//! External calls in this system are wrapped in a pipeline that degrades
//! gracefully instead of failing hard: a per-service circuit breaker fails
//! fast during outages, a retry controller re-runs transient failures with
//! jittered exponential backoff, a criticality-aware cache serves recent
//! answers, and a degradation router falls back to substitutes when the
//! primary path is gone. Urgency and medical criticality flow through every
//! layer via [`CallContext`], tightening deadlines, raising retry budgets,
//! and unlocking the emergency bypass where it matters.
//!
//! [`ResilienceManager`] is the composition root:
//!
//! ```no_run
//! use pedsguide_resilience::{
//!     CallContext, Criticality, FallbackKind, FallbackStrategy, ResilienceManager,
//!     ServiceRegistration,
//! };
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ResilienceManager::new()?;
//! manager.register_service(
//!     ServiceRegistration::new(
//!         "guidance-api",
//!         Criticality::High,
//!         FallbackStrategy::new(FallbackKind::Static, 0.8, |_ctx| async {
//!             Ok(json!({"advice": "call your pediatrician"}))
//!         })?,
//!     ),
//!     None,
//!     None,
//! )?;
//!
//! let ctx = CallContext::new("fetch-guidance")
//!     .criticality(Criticality::High)
//!     .cache_key("guidance:fever");
//! let answer = manager
//!     .execute_with_resilience("guidance-api", &ctx, || async {
//!         Ok(json!({"advice": "hydrate and monitor"}))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod context;
pub mod degradation;
pub mod error;
pub mod facade;
pub mod metrics;
pub mod retry;

pub use cache::{CacheConfig, CacheStats, CacheStore};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use clock::{Clock, MockClock, SystemClock};
pub use context::{CallContext, Criticality};
pub use degradation::{
    DegradationRouter, FallbackKind, FallbackStrategy, ServiceHealth, ServiceRegistration,
};
pub use error::{BoxedError, ResilienceError, ResilienceResult};
pub use facade::{ResilienceManager, ResilienceManagerBuilder, ServiceStatus};
pub use metrics::{
    ImpactLevel, MetricRecorder, MetricSummary, MetricUnit, PerformanceReport, ThresholdConfig,
};
pub use retry::{RetryConfig, RetryController};
