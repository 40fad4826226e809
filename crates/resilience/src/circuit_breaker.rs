//! Per-service circuit breaker.
//!
//! Tracks consecutive failures for a single upstream service and fails fast
//! once a threshold is crossed, giving the service room to recover. State
//! transitions are lazy: an open circuit moves to half-open the first time it
//! is observed after the recovery timeout, not on a background timer.
//!
//! Urgent calls may bypass an open circuit when the service profile allows
//! it. Bypassed calls still record their outcome so the breaker keeps
//! learning about the service while it is open.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::context::CallContext;
use crate::error::{BoxedError, ResilienceError, ResilienceResult};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing a trial request to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait before transitioning from open to half-open
    pub recovery_timeout: Duration,
    /// Whether urgent calls may execute while the circuit is open
    pub allow_emergency_bypass: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            allow_emergency_bypass: false,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::config("failure_threshold must be greater than 0"));
        }

        if self.recovery_timeout.is_zero() {
            return Err(ResilienceError::config("recovery_timeout must be greater than zero"));
        }

        Ok(())
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    pub fn allow_emergency_bypass(mut self, allow: bool) -> Self {
        self.config.allow_emergency_bypass = allow;
        self
    }

    pub fn build(self) -> ResilienceResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Circuit breaker metrics for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub bypassed_calls: u64,
    pub opened_at: Option<Instant>,
}

impl CircuitBreakerMetrics {
    /// Fraction of calls that failed, 0.0 before any call completes.
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_calls as f64
        }
    }
}

/// Circuit breaker guarding calls to a single named service.
///
/// Counts consecutive failures while closed and opens at the configured
/// threshold. An open circuit rejects calls until the recovery timeout has
/// elapsed, then admits one trial: success closes the circuit, failure
/// reopens it and restarts the timer.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    service: String,
    config: CircuitBreakerConfig,
    state: Arc<RwLock<CircuitState>>,
    opened_at: Arc<RwLock<Option<Instant>>>,
    consecutive_failures: Arc<AtomicU32>,
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    bypassed_calls: Arc<AtomicU64>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("config", &self.config)
            .field("state", &self.state())
            .field("consecutive_failures", &self.consecutive_failures.load(Ordering::Acquire))
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            opened_at: Arc::clone(&self.opened_at),
            consecutive_failures: Arc::clone(&self.consecutive_failures),
            total_calls: Arc::clone(&self.total_calls),
            total_successes: Arc::clone(&self.total_successes),
            total_failures: Arc::clone(&self.total_failures),
            bypassed_calls: Arc::clone(&self.bypassed_calls),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker for a service using the system clock
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> ResilienceResult<Self> {
        Self::with_clock(service, config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(
        service: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: C,
    ) -> ResilienceResult<Self> {
        config.validate()?;

        Ok(Self {
            service: service.into(),
            config,
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            opened_at: Arc::new(RwLock::new(None)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            bypassed_calls: Arc::new(AtomicU64::new(0)),
            clock: Arc::new(clock),
        })
    }

    /// Name of the service this breaker guards
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Get the current state, applying the lazy open-to-half-open transition
    /// when the recovery timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        let state = self.read_state();
        if state != CircuitState::Open {
            return state;
        }

        let recovered = match self.opened_at.read() {
            Ok(guard) => guard
                .map(|opened| {
                    self.clock.now().duration_since(opened) >= self.config.recovery_timeout
                })
                .unwrap_or(false),
            Err(poisoned) => {
                warn!(service = %self.service, "Circuit breaker opened_at lock poisoned");
                poisoned
                    .into_inner()
                    .map(|opened| {
                        self.clock.now().duration_since(opened) >= self.config.recovery_timeout
                    })
                    .unwrap_or(false)
            }
        };

        if recovered {
            self.set_state(CircuitState::HalfOpen);
            info!(service = %self.service, "Circuit breaker half-open, admitting trial call");
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    /// Fast check whether the circuit currently admits calls
    pub fn is_available(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// Rejects the call if the circuit is open, unless the call is urgent and
    /// the configuration allows emergency bypass. The operation runs under
    /// the per-attempt deadline derived from the call context, and its
    /// outcome updates the circuit state either way.
    #[instrument(skip(self, ctx, operation), fields(service = %self.service, state = %self.state()))]
    pub async fn execute<F, Fut, T>(&self, ctx: &CallContext, operation: F) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BoxedError>>,
    {
        let state = self.state();
        if state == CircuitState::Open {
            if ctx.urgent && self.config.allow_emergency_bypass {
                self.bypassed_calls.fetch_add(1, Ordering::Relaxed);
                warn!(
                    service = %self.service,
                    operation = %ctx.operation,
                    "Urgent call bypassing open circuit"
                );
            } else {
                debug!(service = %self.service, "Circuit breaker rejecting call");
                return Err(ResilienceError::CircuitOpen {
                    service: self.service.clone(),
                    state: CircuitState::Open,
                });
            }
        }

        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let deadline = ctx.attempt_deadline();
        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!(service = %self.service, "Call cancelled before completion");
                return Err(ResilienceError::Cancelled);
            }
            result = tokio::time::timeout(deadline, operation()) => result,
        };

        match outcome {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(error)) => {
                self.record_failure();
                debug!(service = %self.service, error = %error, "Call failed");
                Err(ResilienceError::Operation { source: error })
            }
            Err(_) => {
                self.record_failure();
                warn!(service = %self.service, ?deadline, "Call exceeded attempt deadline");
                Err(ResilienceError::Timeout { elapsed: deadline })
            }
        }
    }

    /// Record a successful call outcome
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);

        match self.read_state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                self.consecutive_failures.store(0, Ordering::Release);
                self.set_state(CircuitState::Closed);
                self.set_opened_at(None);
                info!(service = %self.service, "Circuit breaker closed after trial success");
            }
            CircuitState::Open => {
                // Bypassed call succeeded while open; the trial after the
                // recovery timeout still decides whether to close.
                debug!(service = %self.service, "Success recorded while circuit open");
            }
        }
    }

    /// Record a failed call outcome
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let now = self.clock.now();

        match self.read_state() {
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold {
                    self.consecutive_failures.store(0, Ordering::Release);
                    self.set_state(CircuitState::Open);
                    self.set_opened_at(Some(now));
                    warn!(
                        service = %self.service,
                        failures,
                        "Circuit breaker opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.consecutive_failures.store(0, Ordering::Release);
                self.set_state(CircuitState::Open);
                self.set_opened_at(Some(now));
                warn!(service = %self.service, "Circuit breaker reopened, trial call failed");
            }
            CircuitState::Open => {
                // Bypassed call failed; keep the original recovery window.
            }
        }
    }

    /// Get a snapshot of breaker metrics
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            total_calls: self.total_calls.load(Ordering::Acquire),
            total_successes: self.total_successes.load(Ordering::Acquire),
            total_failures: self.total_failures.load(Ordering::Acquire),
            bypassed_calls: self.bypassed_calls.load(Ordering::Acquire),
            opened_at: self.opened_at.read().ok().and_then(|guard| *guard),
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.set_state(CircuitState::Closed);
        self.set_opened_at(None);
        info!(service = %self.service, "Circuit breaker manually reset to closed state");
    }

    fn read_state(&self) -> CircuitState {
        match self.state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => {
                warn!(service = %self.service, "Circuit breaker state lock poisoned");
                *poisoned.into_inner()
            }
        }
    }

    fn set_state(&self, new_state: CircuitState) {
        match self.state.write() {
            Ok(mut guard) => *guard = new_state,
            Err(poisoned) => {
                warn!(service = %self.service, "Circuit breaker state lock poisoned on write");
                *poisoned.into_inner() = new_state;
            }
        }
    }

    fn set_opened_at(&self, at: Option<Instant>) {
        match self.opened_at.write() {
            Ok(mut guard) => *guard = at,
            Err(poisoned) => {
                warn!(service = %self.service, "Circuit breaker opened_at lock poisoned on write");
                *poisoned.into_inner() = at;
            }
        }
    }
}
