//! Performance metric recording and threshold reporting.
//!
//! Samples land in bounded per-name rings, are checked against configured
//! thresholds as they arrive, and can be rolled up into a windowed report
//! with an overall score and impact classification.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{error, warn};

use crate::clock::{Clock, SystemClock};
use crate::context::{CallContext, Criticality};
use crate::error::{ResilienceError, ResilienceResult};

/// Samples kept per metric name; the oldest is dropped past this.
pub const METRIC_RING_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    Milliseconds,
    Count,
    Bytes,
    Percent,
}

impl std::fmt::Display for MetricUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Milliseconds => "ms",
            Self::Count => "count",
            Self::Bytes => "bytes",
            Self::Percent => "percent",
        };
        f.write_str(s)
    }
}

/// Warning and critical cutoffs for one metric name.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdConfig {
    pub warning: f64,
    pub critical: f64,
}

impl ThresholdConfig {
    pub fn new(warning: f64, critical: f64) -> ResilienceResult<Self> {
        if warning > critical {
            return Err(ResilienceError::config(format!(
                "warning threshold {warning} must not exceed critical threshold {critical}"
            )));
        }
        Ok(Self { warning, critical })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationSeverity {
    Warning,
    Critical,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warning => f.write_str("warning"),
            Self::Critical => f.write_str("critical"),
        }
    }
}

/// One sample that crossed a threshold inside the report window.
#[derive(Debug, Clone)]
pub struct ThresholdViolation {
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub severity: ViolationSeverity,
    /// Whether the sample came from an urgent call.
    pub urgent: bool,
    /// Criticality of the call that produced the sample.
    pub criticality: Criticality,
}

/// Overall classification for a report window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for ImpactLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct MetricSummary {
    pub name: String,
    pub unit: MetricUnit,
    pub count: usize,
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

#[derive(Debug, Clone)]
pub struct PerformanceReport {
    pub window: Duration,
    pub summaries: Vec<MetricSummary>,
    pub violations: Vec<ThresholdViolation>,
    /// 100 minus deductions per violation, floored at 0.
    pub score: u32,
    pub impact: ImpactLevel,
}

#[derive(Debug, Clone)]
struct MetricSample {
    value: f64,
    unit: MetricUnit,
    urgent: bool,
    criticality: Criticality,
    recorded_at: Instant,
}

/// Bounded in-memory metric store with immediate threshold checks.
pub struct MetricRecorder<C: Clock = SystemClock> {
    rings: DashMap<String, VecDeque<MetricSample>>,
    thresholds: DashMap<String, ThresholdConfig>,
    clock: Arc<C>,
}

impl<C: Clock> std::fmt::Debug for MetricRecorder<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRecorder")
            .field("metrics", &self.rings.len())
            .field("thresholds", &self.thresholds.len())
            .finish()
    }
}

impl MetricRecorder<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MetricRecorder<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MetricRecorder<C> {
    pub fn with_clock(clock: C) -> Self {
        Self { rings: DashMap::new(), thresholds: DashMap::new(), clock: Arc::new(clock) }
    }

    /// Configure (or replace) the thresholds for a metric name.
    pub fn set_threshold(&self, metric: impl Into<String>, config: ThresholdConfig) {
        self.thresholds.insert(metric.into(), config);
    }

    /// Append a sample and log any threshold violation immediately.
    pub fn record(&self, name: &str, value: f64, unit: MetricUnit, ctx: &CallContext) {
        let sample = MetricSample {
            value,
            unit,
            urgent: ctx.urgent,
            criticality: ctx.criticality,
            recorded_at: self.clock.now(),
        };

        let mut ring = self.rings.entry(name.to_string()).or_default();
        if ring.len() >= METRIC_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(sample);
        drop(ring);

        if let Some(threshold) = self.thresholds.get(name) {
            if value >= threshold.critical {
                error!(
                    metric = name,
                    value,
                    threshold = threshold.critical,
                    urgent = ctx.urgent,
                    criticality = %ctx.criticality,
                    "Metric exceeded critical threshold"
                );
            } else if value >= threshold.warning {
                warn!(
                    metric = name,
                    value,
                    threshold = threshold.warning,
                    "Metric exceeded warning threshold"
                );
            }
        }
    }

    /// Time an operation, recording elapsed milliseconds under `name` on
    /// success and `<name>_error` on failure.
    pub async fn measure<F, Fut, T>(
        &self,
        name: &str,
        ctx: &CallContext,
        operation: F,
    ) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ResilienceResult<T>>,
    {
        let started = self.clock.now();
        let result = operation().await;
        let elapsed_ms = self.clock.now().duration_since(started).as_secs_f64() * 1000.0;

        match &result {
            Ok(_) => self.record(name, elapsed_ms, MetricUnit::Milliseconds, ctx),
            Err(_) => {
                self.record(&format!("{name}_error"), elapsed_ms, MetricUnit::Milliseconds, ctx);
            }
        }
        result
    }

    /// Summary for a single metric over the trailing `window`, if it has
    /// any samples in range.
    pub fn summary(&self, name: &str, window: Duration) -> Option<MetricSummary> {
        let now = self.clock.now();
        let ring = self.rings.get(name)?;
        let recent: Vec<&MetricSample> =
            ring.value().iter().filter(|s| now.duration_since(s.recorded_at) <= window).collect();
        let first = recent.first()?;

        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for sample in &recent {
            min = min.min(sample.value);
            max = max.max(sample.value);
            sum += sample.value;
        }
        Some(MetricSummary {
            name: name.to_string(),
            unit: first.unit,
            count: recent.len(),
            min,
            avg: sum / recent.len() as f64,
            max,
        })
    }

    /// Aggregate samples recorded within the trailing `window`.
    pub fn report(&self, window: Duration) -> PerformanceReport {
        let now = self.clock.now();
        let mut summaries = Vec::new();
        let mut violations = Vec::new();

        for ring in self.rings.iter() {
            let name = ring.key();
            let recent: Vec<&MetricSample> = ring
                .value()
                .iter()
                .filter(|s| now.duration_since(s.recorded_at) <= window)
                .collect();
            let Some(first) = recent.first() else { continue };

            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            let mut sum = 0.0;
            for sample in &recent {
                min = min.min(sample.value);
                max = max.max(sample.value);
                sum += sample.value;
            }
            summaries.push(MetricSummary {
                name: name.clone(),
                unit: first.unit,
                count: recent.len(),
                min,
                avg: sum / recent.len() as f64,
                max,
            });

            if let Some(threshold) = self.thresholds.get(name) {
                for sample in &recent {
                    let (severity, cutoff) = if sample.value >= threshold.critical {
                        (ViolationSeverity::Critical, threshold.critical)
                    } else if sample.value >= threshold.warning {
                        (ViolationSeverity::Warning, threshold.warning)
                    } else {
                        continue;
                    };
                    violations.push(ThresholdViolation {
                        metric: name.clone(),
                        value: sample.value,
                        threshold: cutoff,
                        severity,
                        urgent: sample.urgent,
                        criticality: sample.criticality,
                    });
                }
            }
        }

        summaries.sort_by(|a, b| a.name.cmp(&b.name));

        let criticals =
            violations.iter().filter(|v| v.severity == ViolationSeverity::Critical).count();
        let warnings =
            violations.iter().filter(|v| v.severity == ViolationSeverity::Warning).count();
        let urgent_violations = violations.iter().filter(|v| v.urgent).count();
        let urgent_criticals = violations
            .iter()
            .filter(|v| v.urgent && v.severity == ViolationSeverity::Critical)
            .count();

        let score = 100i64
            - 20 * criticals as i64
            - 5 * warnings as i64
            - 10 * urgent_violations as i64;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let score = score.max(0) as u32;

        let impact = if criticals >= 3 || urgent_criticals > 0 {
            ImpactLevel::Critical
        } else if criticals > 0 {
            ImpactLevel::High
        } else if warnings >= 3 {
            ImpactLevel::Medium
        } else {
            ImpactLevel::Low
        };

        PerformanceReport { window, summaries, violations, score, impact }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    const WINDOW: Duration = Duration::from_secs(300);

    fn recorder() -> (MetricRecorder<MockClock>, MockClock) {
        let clock = MockClock::new();
        (MetricRecorder::with_clock(clock.clone()), clock)
    }

    fn ctx() -> CallContext {
        CallContext::new("fetch-guidance")
    }

    #[test]
    fn aggregates_min_avg_max_per_metric() {
        let (metrics, _) = recorder();
        let ctx = ctx();
        for value in [10.0, 20.0, 30.0] {
            metrics.record("latency", value, MetricUnit::Milliseconds, &ctx);
        }

        let report = metrics.report(WINDOW);
        assert_eq!(report.summaries.len(), 1);
        let summary = &report.summaries[0];
        assert_eq!(summary.name, "latency");
        assert_eq!(summary.count, 3);
        assert!((summary.min - 10.0).abs() < f64::EPSILON);
        assert!((summary.avg - 20.0).abs() < f64::EPSILON);
        assert!((summary.max - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ring_drops_oldest_past_capacity() {
        let (metrics, _) = recorder();
        let ctx = ctx();
        for i in 0..(METRIC_RING_CAPACITY + 5) {
            metrics.record("latency", i as f64, MetricUnit::Count, &ctx);
        }

        let report = metrics.report(WINDOW);
        let summary = &report.summaries[0];
        assert_eq!(summary.count, METRIC_RING_CAPACITY);
        // The five oldest samples (0..5) were dropped.
        assert!((summary.min - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn summary_covers_one_metric_within_window() {
        let (metrics, clock) = recorder();
        let ctx = ctx();

        metrics.record("latency", 120.0, MetricUnit::Milliseconds, &ctx);
        clock.advance(Duration::from_secs(600));
        metrics.record("latency", 60.0, MetricUnit::Milliseconds, &ctx);
        metrics.record("latency", 80.0, MetricUnit::Milliseconds, &ctx);

        let summary = metrics.summary("latency", WINDOW).expect("has samples");
        assert_eq!(summary.count, 2);
        assert!((summary.min - 60.0).abs() < f64::EPSILON);
        assert!((summary.max - 80.0).abs() < f64::EPSILON);
        assert!(metrics.summary("missing", WINDOW).is_none());
    }

    #[test]
    fn report_window_excludes_old_samples() {
        let (metrics, clock) = recorder();
        let ctx = ctx();

        metrics.record("latency", 100.0, MetricUnit::Milliseconds, &ctx);
        clock.advance(Duration::from_secs(600));
        metrics.record("latency", 40.0, MetricUnit::Milliseconds, &ctx);

        let report = metrics.report(WINDOW);
        let summary = &report.summaries[0];
        assert_eq!(summary.count, 1);
        assert!((summary.max - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn clean_window_scores_one_hundred() {
        let (metrics, _) = recorder();
        metrics.set_threshold("latency", ThresholdConfig::new(100.0, 200.0).expect("valid"));
        metrics.record("latency", 50.0, MetricUnit::Milliseconds, &ctx());

        let report = metrics.report(WINDOW);
        assert_eq!(report.score, 100);
        assert_eq!(report.impact, ImpactLevel::Low);
        assert!(report.violations.is_empty());
    }

    #[test]
    fn score_deducts_per_violation_severity() {
        let (metrics, _) = recorder();
        metrics.set_threshold("latency", ThresholdConfig::new(100.0, 200.0).expect("valid"));
        let ctx = ctx();

        metrics.record("latency", 150.0, MetricUnit::Milliseconds, &ctx); // warning
        metrics.record("latency", 250.0, MetricUnit::Milliseconds, &ctx); // critical

        let report = metrics.report(WINDOW);
        assert_eq!(report.score, 75); // 100 - 20 - 5
        assert_eq!(report.impact, ImpactLevel::High);
    }

    #[test]
    fn urgent_violations_cost_extra_and_escalate_impact() {
        let (metrics, _) = recorder();
        metrics.set_threshold("latency", ThresholdConfig::new(100.0, 200.0).expect("valid"));

        let urgent = ctx().urgent(true);
        metrics.record("latency", 250.0, MetricUnit::Milliseconds, &urgent);

        let report = metrics.report(WINDOW);
        assert_eq!(report.score, 70); // 100 - 20 - 10
        assert_eq!(report.impact, ImpactLevel::Critical);
    }

    #[test]
    fn violations_carry_call_criticality() {
        let (metrics, _) = recorder();
        metrics.set_threshold("latency", ThresholdConfig::new(100.0, 200.0).expect("valid"));

        let ctx = ctx().criticality(Criticality::Critical);
        metrics.record("latency", 250.0, MetricUnit::Milliseconds, &ctx);

        let report = metrics.report(WINDOW);
        let violation = &report.violations[0];
        assert_eq!(violation.severity, ViolationSeverity::Critical);
        assert_eq!(violation.criticality, Criticality::Critical);
        assert!(!violation.urgent);
    }

    #[test]
    fn repeated_criticals_classify_as_critical_impact() {
        let (metrics, _) = recorder();
        metrics.set_threshold("latency", ThresholdConfig::new(100.0, 200.0).expect("valid"));
        let ctx = ctx();
        for _ in 0..3 {
            metrics.record("latency", 300.0, MetricUnit::Milliseconds, &ctx);
        }

        let report = metrics.report(WINDOW);
        assert_eq!(report.impact, ImpactLevel::Critical);
        assert_eq!(report.score, 40); // 100 - 3 * 20
    }

    #[test]
    fn repeated_warnings_classify_as_medium_impact() {
        let (metrics, _) = recorder();
        metrics.set_threshold("latency", ThresholdConfig::new(100.0, 200.0).expect("valid"));
        let ctx = ctx();
        for _ in 0..3 {
            metrics.record("latency", 150.0, MetricUnit::Milliseconds, &ctx);
        }

        let report = metrics.report(WINDOW);
        assert_eq!(report.impact, ImpactLevel::Medium);
        assert_eq!(report.score, 85); // 100 - 3 * 5
    }

    #[test]
    fn threshold_ordering_is_validated() {
        assert!(ThresholdConfig::new(200.0, 100.0).is_err());
    }

    #[tokio::test]
    async fn measure_records_elapsed_on_success() {
        let (metrics, clock) = recorder();
        let ctx = ctx();

        let result = metrics
            .measure("op_time", &ctx, || {
                clock.advance(Duration::from_millis(25));
                async { Ok::<_, ResilienceError>(42) }
            })
            .await
            .expect("operation succeeds");
        assert_eq!(result, 42);

        let report = metrics.report(WINDOW);
        let summary = &report.summaries[0];
        assert_eq!(summary.name, "op_time");
        assert!((summary.max - 25.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn measure_records_error_suffixed_metric_on_failure() {
        let (metrics, _) = recorder();
        let ctx = ctx();

        let result: ResilienceResult<()> = metrics
            .measure("op_time", &ctx, || async {
                Err(ResilienceError::Unavailable { service: "triage".into() })
            })
            .await;
        assert!(result.is_err());

        let report = metrics.report(WINDOW);
        assert_eq!(report.summaries.len(), 1);
        assert_eq!(report.summaries[0].name, "op_time_error");
    }
}
