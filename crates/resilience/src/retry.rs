//! Retry controller with exponential backoff and jitter.
//!
//! Retries an async operation on transiently-classified failures. The number
//! of attempts scales with the call's criticality and urgency: high and
//! critical calls get a higher floor, and urgent calls with the emergency
//! override enabled are retried up to seven times. Delays grow exponentially
//! with ±10% jitter and are capped so urgent callers never wait long between
//! attempts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use crate::context::{CallContext, Criticality};
use crate::error::{ResilienceError, ResilienceResult};

/// Attempts raised to this floor when the context is urgent and the
/// emergency override is enabled.
const URGENT_ATTEMPT_FLOOR: u32 = 7;

/// Delay cap for urgent contexts.
const URGENT_DELAY_CAP: Duration = Duration::from_secs(5);

/// Delay cap for critical-criticality contexts.
const CRITICAL_DELAY_CAP: Duration = Duration::from_secs(10);

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Baseline maximum attempts before criticality/urgency floors apply
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Exponential growth factor applied per attempt
    pub multiplier: f64,
    /// Upper bound on the computed delay, before urgency caps
    pub max_delay: Duration,
    /// Whether urgent contexts may raise the attempt count to the emergency
    /// floor
    pub emergency_override: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            emergency_override: true,
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::config("max_attempts must be greater than 0"));
        }

        if self.base_delay.is_zero() {
            return Err(ResilienceError::config("base_delay must be greater than zero"));
        }

        if self.multiplier < 1.0 {
            return Err(ResilienceError::config("multiplier must be at least 1.0"));
        }

        if self.max_delay < self.base_delay {
            return Err(ResilienceError::config("max_delay must be at least base_delay"));
        }

        Ok(())
    }
}

/// Builder for RetryConfig with fluent API
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.config.multiplier = multiplier;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn emergency_override(mut self, enabled: bool) -> Self {
        self.config.emergency_override = enabled;
        self
    }

    pub fn build(self) -> ResilienceResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Retry executor driven by the call context.
#[derive(Debug, Clone)]
pub struct RetryController {
    config: RetryConfig,
}

impl Default for RetryController {
    fn default() -> Self {
        Self { config: RetryConfig::default() }
    }
}

impl RetryController {
    pub fn new(config: RetryConfig) -> ResilienceResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Effective attempt count for a context.
    ///
    /// Criticality raises the configured default to 4 (HIGH) or 5 (CRITICAL);
    /// an urgent context with the emergency override enabled raises it to 7.
    pub fn effective_attempts(&self, ctx: &CallContext) -> u32 {
        let mut attempts = self.config.max_attempts.max(ctx.criticality.attempt_floor());
        if ctx.urgent && self.config.emergency_override {
            attempts = attempts.max(URGENT_ATTEMPT_FLOOR);
        }
        attempts
    }

    /// Deterministic backoff delay for a 1-based attempt number, before
    /// jitter and urgency caps.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let raw_ms = self.config.base_delay.as_millis() as f64
            * self.config.multiplier.powi(exponent as i32);
        let capped_ms = raw_ms.min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Delay actually slept before the next attempt: backoff with ±10%
    /// jitter, then capped at 5s for urgent contexts or 10s for CRITICAL
    /// criticality.
    pub fn delay_for_attempt(&self, attempt: u32, ctx: &CallContext) -> Duration {
        let base = self.backoff_delay(attempt);
        let factor: f64 = rand::thread_rng().gen_range(0.9..=1.1);
        let jittered = Duration::from_millis((base.as_millis() as f64 * factor) as u64);

        if ctx.urgent {
            jittered.min(URGENT_DELAY_CAP)
        } else if ctx.criticality == Criticality::Critical {
            jittered.min(CRITICAL_DELAY_CAP)
        } else {
            jittered
        }
    }

    /// Execute an operation, retrying transient failures.
    ///
    /// Attempts for one logical call are strictly sequential. A non-retryable
    /// error propagates immediately without delay; cancellation aborts both
    /// in-flight waits and further attempts.
    #[instrument(skip(self, ctx, operation), fields(operation = %ctx.operation, urgent = ctx.urgent))]
    pub async fn execute<F, Fut, T>(&self, ctx: &CallContext, mut operation: F) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let max_attempts = self.effective_attempts(ctx);
        let mut attempt = 1u32;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }

            debug!(attempt, max_attempts, "Executing operation");

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !error.is_retryable() {
                        debug!(attempt, error = %error, "Non-retryable error, not retrying");
                        return Err(error);
                    }

                    if attempt >= max_attempts {
                        warn!(
                            attempts = max_attempts,
                            error = %error,
                            "All retry attempts exhausted"
                        );
                        return Err(ResilienceError::RetryExhausted {
                            attempts: max_attempts,
                            source: Box::new(error),
                        });
                    }

                    let delay = self.delay_for_attempt(attempt, ctx);
                    warn!(attempt, ?delay, error = %error, "Attempt failed, retrying");

                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(ResilienceError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }

                    attempt += 1;
                }
            }
        }
    }
}
