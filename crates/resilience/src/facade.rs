//! Resilience facade.
//!
//! [`ResilienceManager`] composes the cache, circuit breakers, retry
//! controller, degradation router, and metric recorder behind two entry
//! points. Construct one at startup and share it by handle; there is no
//! process-global instance.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheConfig, CacheStats, CacheStore};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics};
use crate::context::{CallContext, Criticality};
use crate::degradation::{DegradationRouter, ServiceHealth, ServiceRegistration};
use crate::error::{BoxedError, ResilienceError, ResilienceResult};
use crate::metrics::{MetricRecorder, MetricSummary, PerformanceReport, ThresholdConfig};
use crate::retry::{RetryConfig, RetryController};

/// Response-time cutoffs applied to every registered service, in ms.
const RESPONSE_TIME_WARNING_MS: f64 = 3_000.0;
const RESPONSE_TIME_CRITICAL_MS: f64 = 10_000.0;

/// Trailing window used for the per-service status summary.
const STATUS_WINDOW: Duration = Duration::from_secs(300);

struct ServiceHandles {
    criticality: Criticality,
    breaker: CircuitBreaker,
    retry: RetryController,
}

/// Combined circuit, availability, cache, and timing view of one service.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub circuit: CircuitBreakerMetrics,
    pub failure_rate: f64,
    pub availability: Option<ServiceHealth>,
    pub cache_hit_rate: f64,
    pub recent_response_time: Option<MetricSummary>,
}

#[derive(Debug, Default)]
pub struct ResilienceManagerBuilder {
    retry: Option<RetryConfig>,
    cache: Option<CacheConfig>,
}

impl ResilienceManagerBuilder {
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    pub fn build(self) -> ResilienceResult<ResilienceManager> {
        let retry = RetryController::new(self.retry.unwrap_or_default())?;
        let cache = Arc::new(CacheStore::new(self.cache.unwrap_or_default())?);
        Ok(ResilienceManager {
            services: DashMap::new(),
            default_retry: retry,
            cache,
            degradation: Arc::new(DegradationRouter::new()),
            metrics: Arc::new(MetricRecorder::new()),
        })
    }
}

/// Single entry point for resilient calls to external services.
pub struct ResilienceManager {
    services: DashMap<String, Arc<ServiceHandles>>,
    default_retry: RetryController,
    cache: Arc<CacheStore>,
    degradation: Arc<DegradationRouter>,
    metrics: Arc<MetricRecorder>,
}

impl std::fmt::Debug for ResilienceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceManager")
            .field("services", &self.services.len())
            .finish_non_exhaustive()
    }
}

impl ResilienceManager {
    pub fn new() -> ResilienceResult<Self> {
        Self::builder().build()
    }

    pub fn builder() -> ResilienceManagerBuilder {
        ResilienceManagerBuilder::default()
    }

    /// Register a service with its fallback strategy and optional circuit
    /// and retry overrides. Criticality drives the circuit defaults: more
    /// critical services trip sooner, probe recovery faster, and allow the
    /// emergency bypass.
    pub fn register_service(
        &self,
        registration: ServiceRegistration,
        circuit: Option<CircuitBreakerConfig>,
        retry: Option<RetryConfig>,
    ) -> ResilienceResult<()> {
        let name = registration.name.clone();
        let criticality = registration.criticality;

        let circuit = circuit.unwrap_or_else(|| default_circuit_config(criticality));
        let retry = match retry {
            Some(config) => RetryController::new(config)?,
            None => self.default_retry.clone(),
        };

        let breaker = CircuitBreaker::new(name.clone(), circuit)?;
        self.services.insert(name.clone(), Arc::new(ServiceHandles { criticality, breaker, retry }));
        self.degradation.register(registration);

        self.metrics.set_threshold(
            response_time_metric(&name),
            ThresholdConfig::new(RESPONSE_TIME_WARNING_MS, RESPONSE_TIME_CRITICAL_MS)?,
        );
        Ok(())
    }

    /// Execute an operation with the full resilience pipeline.
    ///
    /// The context's criticality is raised to the registered service's
    /// level when the caller left it lower, so attempt floors, deadlines
    /// and cache TTLs follow the service. Cache lookup first when the
    /// context names a key. Otherwise the operation runs under the
    /// service's circuit breaker inside the retry loop, with elapsed time
    /// recorded. On total failure the degradation router gets a chance to
    /// serve a substitute before the error surfaces. Caller cancellation
    /// propagates untouched and never triggers degradation.
    #[instrument(skip(self, ctx, operation), fields(operation = %ctx.operation, urgent = ctx.urgent))]
    pub async fn execute_with_resilience<F, Fut>(
        &self,
        service: &str,
        ctx: &CallContext,
        operation: F,
    ) -> ResilienceResult<Value>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, BoxedError>>,
    {
        let handles = self.handles(service, ctx.criticality)?;
        let raised;
        let ctx = if handles.criticality > ctx.criticality {
            raised = ctx.clone().criticality(handles.criticality);
            &raised
        } else {
            ctx
        };

        if let Some(key) = &ctx.cache_key {
            if let Some(value) = self.cache.get(key, ctx)? {
                debug!(service, key, "Cache hit, skipping call");
                return Ok(value);
            }
        }

        let metric = response_time_metric(service);

        let outcome = self
            .metrics
            .measure(&metric, ctx, || {
                handles.retry.execute(ctx, || handles.breaker.execute(ctx, || operation()))
            })
            .await;

        match outcome {
            Ok(value) => {
                self.cache_result(ctx, &value);
                self.degradation.mark_available(service);
                Ok(value)
            }
            Err(ResilienceError::Cancelled) => Err(ResilienceError::Cancelled),
            Err(error) => {
                let value = self.degradation.route_failure(service, ctx, error).await?;
                self.cache_result(ctx, &value);
                Ok(value)
            }
        }
    }

    /// Same pipeline with the urgent flag forced on.
    pub async fn execute_emergency_operation<F, Fut>(
        &self,
        service: &str,
        ctx: &CallContext,
        operation: F,
    ) -> ResilienceResult<Value>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, BoxedError>>,
    {
        let ctx = ctx.clone().urgent(true);
        self.execute_with_resilience(service, &ctx, operation).await
    }

    /// Circuit and availability snapshot for one service, if known.
    pub fn health_status(&self, service: &str) -> Option<ServiceStatus> {
        self.services.get(service).map(|handles| {
            let circuit = handles.breaker.metrics();
            let failure_rate = circuit.failure_rate();
            ServiceStatus {
                circuit,
                failure_rate,
                availability: self.degradation.health(service),
                cache_hit_rate: self.cache.stats().hit_rate(),
                recent_response_time: self
                    .metrics
                    .summary(&response_time_metric(service), STATUS_WINDOW),
            }
        })
    }

    /// Whether any critical service is currently down.
    pub fn emergency_mode(&self) -> bool {
        self.degradation.emergency_mode()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Wipe sensitive cache entries, returning how many were removed.
    pub fn clear_sensitive_cache(&self) -> usize {
        self.cache.clear_sensitive()
    }

    pub fn performance_report(&self, window: Duration) -> PerformanceReport {
        self.metrics.report(window)
    }

    /// Start the cache sweeper and health-check loops. Both stop when the
    /// token is cancelled.
    pub fn spawn_background_tasks(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            Arc::clone(&self.cache).spawn_sweeper(shutdown.clone()),
            Arc::clone(&self.degradation).spawn_health_checks(shutdown),
        ]
    }

    fn cache_result(&self, ctx: &CallContext, value: &Value) {
        let Some(key) = &ctx.cache_key else { return };
        match self.cache.set(key, value, ctx, None) {
            Ok(true) => {}
            Ok(false) => debug!(key, "Result not cached"),
            Err(error) => warn!(key, %error, "Failed to cache result"),
        }
    }

    /// Handles for a service, created on first use for unregistered ones.
    fn handles(&self, service: &str, criticality: Criticality) -> ResilienceResult<Arc<ServiceHandles>> {
        if let Some(handles) = self.services.get(service) {
            return Ok(Arc::clone(&handles));
        }
        let handles = Arc::new(ServiceHandles {
            criticality,
            breaker: CircuitBreaker::new(service, default_circuit_config(criticality))?,
            retry: self.default_retry.clone(),
        });
        Ok(self.services.entry(service.to_string()).or_insert(handles).clone())
    }
}

fn response_time_metric(service: &str) -> String {
    format!("{service}_response_time")
}

fn default_circuit_config(criticality: Criticality) -> CircuitBreakerConfig {
    match criticality {
        Criticality::Critical => CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            allow_emergency_bypass: true,
        },
        Criticality::High => CircuitBreakerConfig {
            failure_threshold: 4,
            recovery_timeout: Duration::from_secs(45),
            allow_emergency_bypass: false,
        },
        Criticality::Low | Criticality::Medium => CircuitBreakerConfig::default(),
    }
}
