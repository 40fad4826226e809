//! Integration tests for the resilience pipeline
//!
//! Exercises circuit breaking, retry scaling, criticality-aware caching and
//! degradation routing end to end through the facade, plus the documented
//! failure scenarios for each component.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pedsguide_resilience::{
    BoxedError, CacheConfig, CacheStore, CallContext, CircuitBreaker, CircuitBreakerConfig,
    CircuitState, Criticality, FallbackKind, FallbackStrategy, MetricRecorder, MockClock,
    ResilienceError, ResilienceManager, RetryController, ServiceRegistration, ThresholdConfig,
};
use serde_json::{json, Value};

fn static_fallback(payload: Value) -> FallbackStrategy {
    FallbackStrategy::new(FallbackKind::Static, 0.9, move |_ctx| {
        let payload = payload.clone();
        async move { Ok(payload) }
    })
    .expect("Failed to build fallback strategy")
}

/// Scenario A: three consecutive failures open the circuit, and the fourth
/// call inside the recovery window fails fast without ever invoking the
/// underlying operation.
#[tokio::test]
async fn circuit_opens_after_threshold_and_fails_fast() {
    let clock = MockClock::new();
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(3)
        .recovery_timeout(Duration::from_secs(60))
        .build()
        .expect("Failed to build config");
    let breaker = CircuitBreaker::with_clock("service-x", config, clock.clone())
        .expect("Failed to build breaker");

    let calls = Arc::new(AtomicU32::new(0));
    let ctx = CallContext::new("fetch");

    for _ in 0..3 {
        let calls = Arc::clone(&calls);
        let result: Result<Value, _> = breaker
            .execute(&ctx, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Value, BoxedError>("connection refused".into())
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // Fourth call within the window: rejected without touching the operation.
    let calls_before = calls.load(Ordering::SeqCst);
    let result: Result<Value, _> = breaker
        .execute(&ctx, || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!("should not run"))
            }
        })
        .await;
    assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), calls_before);
}

/// After the recovery window a single trial call decides the circuit's fate:
/// success closes it and resets the failure counter, failure reopens it.
#[tokio::test]
async fn circuit_recovers_through_half_open_trial() {
    let clock = MockClock::new();
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(2)
        .recovery_timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to build config");
    let breaker = CircuitBreaker::with_clock("service-x", config, clock.clone())
        .expect("Failed to build breaker");
    let ctx = CallContext::new("fetch");

    for _ in 0..2 {
        let _: Result<Value, _> = breaker
            .execute(&ctx, || async { Err::<Value, BoxedError>("timeout".into()) })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    clock.advance(Duration::from_secs(31));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker
        .execute(&ctx, || async { Ok(json!("recovered")) })
        .await
        .expect("Trial call should succeed");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.metrics().consecutive_failures, 0);
}

/// A reopened trial failure restarts the recovery window from scratch.
#[tokio::test]
async fn failed_trial_reopens_the_circuit() {
    let clock = MockClock::new();
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(1)
        .recovery_timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to build config");
    let breaker = CircuitBreaker::with_clock("service-x", config, clock.clone())
        .expect("Failed to build breaker");
    let ctx = CallContext::new("fetch");

    let _: Result<Value, _> = breaker
        .execute(&ctx, || async { Err::<Value, BoxedError>("timeout".into()) })
        .await;
    clock.advance(Duration::from_secs(31));

    let _: Result<Value, _> = breaker
        .execute(&ctx, || async { Err::<Value, BoxedError>("timeout".into()) })
        .await;
    assert_eq!(breaker.state(), CircuitState::Open);

    // Half the window is not enough after the failed trial.
    clock.advance(Duration::from_secs(15));
    assert_eq!(breaker.state(), CircuitState::Open);
    clock.advance(Duration::from_secs(16));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

/// Scenario B: a CRITICAL urgent call keeps retrying through the emergency
/// bypass until the raised attempt budget (7) is spent, then answers from
/// the registered emergency fallback instead of erroring.
#[tokio::test(start_paused = true)]
async fn critical_urgent_call_retries_seven_times_then_uses_emergency_fallback() {
    let manager = ResilienceManager::new().expect("Failed to build manager");
    manager
        .register_service(
            ServiceRegistration::new(
                "triage-api",
                Criticality::Critical,
                static_fallback(json!("standard fallback")),
            )
            .emergency_fallback(static_fallback(json!({"emergency": "payload"}))),
            None,
            None,
        )
        .expect("Failed to register service");

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let ctx = CallContext::new("triage").criticality(Criticality::Critical).urgent(true);

    let result = manager
        .execute_with_resilience("triage-api", &ctx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<Value, BoxedError>("service unavailable".into()) }
        })
        .await
        .expect("Emergency fallback should answer");

    assert_eq!(result, json!({"emergency": "payload"}));
    assert_eq!(attempts.load(Ordering::SeqCst), 7);
}

/// For a LOW-criticality, non-urgent context the retry budget stays at the
/// configured default.
#[tokio::test(start_paused = true)]
async fn low_criticality_calls_stop_at_default_attempts() {
    let retry = RetryController::default();
    let ctx = CallContext::new("fetch").criticality(Criticality::Low);

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let result: Result<Value, _> = retry
        .execute(&ctx, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ResilienceError::Timeout { elapsed: Duration::from_secs(1) }) }
        })
        .await;

    assert!(matches!(result, Err(ResilienceError::RetryExhausted { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

/// Retry delays grow monotonically but stay under the urgent 5s ceiling.
#[test]
fn urgent_delays_never_exceed_five_seconds() {
    let retry = RetryController::default();
    let ctx = CallContext::new("fetch").urgent(true).criticality(Criticality::Critical);

    let mut previous = Duration::ZERO;
    for attempt in 1..=10 {
        let base = retry.backoff_delay(attempt);
        assert!(base >= previous, "Backoff must be non-decreasing");
        previous = base;

        let delay = retry.delay_for_attempt(attempt, &ctx);
        assert!(delay <= Duration::from_millis(5000), "Urgent delay exceeded cap: {delay:?}");
    }
}

/// Scenario C: a sensitive value stored with a 2 hour TTL is gone within 30
/// minutes.
#[tokio::test]
async fn sensitive_values_expire_within_thirty_minutes() {
    let clock = MockClock::new();
    let cache = CacheStore::with_clock(CacheConfig::default(), clock.clone())
        .expect("Failed to build cache");
    let ctx = CallContext::new("fetch-history").criticality(Criticality::Critical);

    let stored = cache
        .set(
            "history:p1",
            &json!({"patientId": "p1", "result": "visit summary"}),
            &ctx,
            Some(Duration::from_secs(2 * 60 * 60)),
        )
        .expect("Failed to store entry");
    assert!(stored);

    clock.advance(Duration::from_secs(29 * 60));
    assert!(cache.get("history:p1", &ctx).expect("get").is_some());

    clock.advance(Duration::from_secs(2 * 60));
    assert_eq!(cache.get("history:p1", &ctx).expect("get"), None);
}

/// Scenario D: a 6000ms sample against warning=2000/critical=5000 shows up
/// as a critical violation in the next report.
#[test]
fn slow_request_produces_critical_violation() {
    let metrics = MetricRecorder::new();
    metrics.set_threshold(
        "request_time",
        ThresholdConfig::new(2000.0, 5000.0).expect("Failed to build threshold"),
    );

    let ctx = CallContext::new("fetch");
    metrics.record(
        "request_time",
        6000.0,
        pedsguide_resilience::MetricUnit::Milliseconds,
        &ctx,
    );

    let report = metrics.report(Duration::from_secs(300));
    assert_eq!(report.violations.len(), 1);
    assert_eq!(report.violations[0].metric, "request_time");
    assert_eq!(report.score, 80);
    assert_eq!(report.impact, pedsguide_resilience::ImpactLevel::High);
}

/// A degraded response is cached under the caller's key, so repeated calls
/// during an outage are served without touching the failing service again.
#[tokio::test(start_paused = true)]
async fn degraded_responses_are_cached_for_subsequent_calls() {
    let manager = ResilienceManager::new().expect("Failed to build manager");
    manager
        .register_service(
            ServiceRegistration::new(
                "guidance-api",
                Criticality::Medium,
                static_fallback(json!({"advice": "see a pediatrician", "degraded": true})),
            ),
            None,
            None,
        )
        .expect("Failed to register service");

    let calls = Arc::new(AtomicU32::new(0));
    let ctx = CallContext::new("fetch-guidance").cache_key("guidance:rash");

    let counter = Arc::clone(&calls);
    let operation = move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<Value, BoxedError>("connection reset".into()) }
    };

    let first = manager
        .execute_with_resilience("guidance-api", &ctx, operation.clone())
        .await
        .expect("Fallback should answer");
    let calls_after_first = calls.load(Ordering::SeqCst);

    let second = manager
        .execute_with_resilience("guidance-api", &ctx, operation)
        .await
        .expect("Cache should answer");

    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), calls_after_first);
    assert_eq!(manager.cache_stats().hits, 1);
}

/// The full pipeline on the happy path: call succeeds, result is cached,
/// service reports healthy, response time is on record.
#[tokio::test]
async fn happy_path_exercises_every_layer() {
    let manager = ResilienceManager::new().expect("Failed to build manager");
    manager
        .register_service(
            ServiceRegistration::new(
                "guidance-api",
                Criticality::High,
                static_fallback(json!("fallback")),
            ),
            None,
            None,
        )
        .expect("Failed to register service");

    let ctx = CallContext::new("fetch-guidance")
        .criticality(Criticality::High)
        .cache_key("guidance:fever");

    let answer = manager
        .execute_with_resilience("guidance-api", &ctx, || async {
            Ok(json!({"advice": "hydrate and monitor"}))
        })
        .await
        .expect("Call should succeed");
    assert_eq!(answer["advice"], json!("hydrate and monitor"));

    let status = manager.health_status("guidance-api").expect("Service is registered");
    assert_eq!(status.circuit.state, CircuitState::Closed);
    assert!(status.availability.expect("Registered with router").available);
    let timing = status.recent_response_time.expect("Call was timed");
    assert_eq!(timing.count, 1);
    assert!(!manager.emergency_mode());

    assert_eq!(manager.cache_stats().inserts, 1);
    let report = manager.performance_report(Duration::from_secs(60));
    assert!(report.summaries.iter().any(|s| s.name == "guidance-api_response_time"));
}
