//! Degradation routing.
//!
//! Each registered service carries a fallback strategy and, optionally, an
//! emergency fallback and a health probe. When the primary path fails the
//! router marks the service unavailable and serves a degraded response from
//! the fallback chain. Urgent calls prefer the emergency fallback. A
//! critical service whose fallbacks all fail still answers with synthesized
//! emergency guidance rather than an error.
//!
//! A background loop probes registered services and flips their availability
//! flags. While any critical service is down the router holds a process-wide
//! emergency-mode flag.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::context::{CallContext, Criticality};
use crate::error::{BoxedError, ResilienceError, ResilienceResult};

/// Probe cadence for critical services.
pub const CRITICAL_PROBE_INTERVAL: Duration = Duration::from_secs(15);
/// Probe cadence for everything else.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

const PROBE_DEADLINE: Duration = Duration::from_secs(5);

type FallbackFn =
    Arc<dyn Fn(CallContext) -> BoxFuture<'static, Result<Value, BoxedError>> + Send + Sync>;
type HealthProbeFn = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// What kind of substitute a fallback produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackKind {
    Cache,
    Static,
    AlternativeService,
    EmergencyProtocol,
    Offline,
}

impl std::fmt::Display for FallbackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cache => "cache",
            Self::Static => "static",
            Self::AlternativeService => "alternative-service",
            Self::EmergencyProtocol => "emergency-protocol",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// A substitute result producer attached to a service at registration time.
#[derive(Clone)]
pub struct FallbackStrategy {
    pub kind: FallbackKind,
    /// Expected reliability of the substitute, in `[0, 1]`.
    pub reliability: f64,
    exec: FallbackFn,
}

impl std::fmt::Debug for FallbackStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackStrategy")
            .field("kind", &self.kind)
            .field("reliability", &self.reliability)
            .finish_non_exhaustive()
    }
}

impl FallbackStrategy {
    pub fn new<F, Fut>(kind: FallbackKind, reliability: f64, exec: F) -> ResilienceResult<Self>
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxedError>> + Send + 'static,
    {
        if !(0.0..=1.0).contains(&reliability) {
            return Err(ResilienceError::config(format!(
                "fallback reliability must be within [0, 1], got {reliability}"
            )));
        }
        Ok(Self { kind, reliability, exec: Arc::new(move |ctx| Box::pin(exec(ctx))) })
    }

    async fn run(&self, ctx: &CallContext) -> Result<Value, BoxedError> {
        (self.exec)(ctx.clone()).await
    }
}

/// Everything the router needs to know about one service.
pub struct ServiceRegistration {
    pub name: String,
    pub criticality: Criticality,
    pub fallback: FallbackStrategy,
    pub emergency_fallback: Option<FallbackStrategy>,
    health_probe: Option<HealthProbeFn>,
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("name", &self.name)
            .field("criticality", &self.criticality)
            .field("fallback", &self.fallback)
            .field("emergency_fallback", &self.emergency_fallback)
            .field("has_health_probe", &self.health_probe.is_some())
            .finish()
    }
}

impl ServiceRegistration {
    pub fn new(
        name: impl Into<String>,
        criticality: Criticality,
        fallback: FallbackStrategy,
    ) -> Self {
        Self {
            name: name.into(),
            criticality,
            fallback,
            emergency_fallback: None,
            health_probe: None,
        }
    }

    /// Attach a fallback reserved for urgent calls.
    pub fn emergency_fallback(mut self, fallback: FallbackStrategy) -> Self {
        self.emergency_fallback = Some(fallback);
        self
    }

    /// Attach an asynchronous health probe used by the background loop.
    pub fn health_probe<F, Fut>(mut self, probe: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.health_probe = Some(Arc::new(move || Box::pin(probe())));
        self
    }
}

/// Point-in-time availability view of one service.
#[derive(Debug, Clone)]
pub struct ServiceHealth {
    pub service: String,
    pub available: bool,
    pub criticality: Criticality,
    pub fallback_kind: FallbackKind,
    pub fallback_reliability: f64,
}

struct ServiceState {
    registration: ServiceRegistration,
    available: AtomicBool,
}

/// Registry of services plus the routing logic between primary and fallback.
#[derive(Default)]
pub struct DegradationRouter {
    services: DashMap<String, ServiceState>,
    emergency_mode: AtomicBool,
}

impl std::fmt::Debug for DegradationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DegradationRouter")
            .field("services", &self.services.len())
            .field("emergency_mode", &self.emergency_mode.load(Ordering::Relaxed))
            .finish()
    }
}

impl DegradationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service; re-registering replaces the previous entry.
    pub fn register(&self, registration: ServiceRegistration) {
        info!(
            service = %registration.name,
            criticality = %registration.criticality,
            fallback = %registration.fallback.kind,
            "Service registered for degradation routing"
        );
        let name = registration.name.clone();
        self.services
            .insert(name, ServiceState { registration, available: AtomicBool::new(true) });
        self.refresh_emergency_mode();
    }

    /// Unknown services are assumed available.
    pub fn is_available(&self, service: &str) -> bool {
        self.services
            .get(service)
            .map(|state| state.available.load(Ordering::Acquire))
            .unwrap_or(true)
    }

    pub fn mark_available(&self, service: &str) {
        if let Some(state) = self.services.get(service) {
            if !state.available.swap(true, Ordering::AcqRel) {
                info!(service, "Service recovered");
            }
        }
        self.refresh_emergency_mode();
    }

    pub fn mark_unavailable(&self, service: &str) {
        if let Some(state) = self.services.get(service) {
            if state.available.swap(false, Ordering::AcqRel) {
                warn!(service, "Service marked unavailable");
            }
        }
        self.refresh_emergency_mode();
    }

    /// Set while any critical service is down.
    pub fn emergency_mode(&self) -> bool {
        self.emergency_mode.load(Ordering::Acquire)
    }

    pub fn health(&self, service: &str) -> Option<ServiceHealth> {
        self.services.get(service).map(|state| ServiceHealth {
            service: state.registration.name.clone(),
            available: state.available.load(Ordering::Acquire),
            criticality: state.registration.criticality,
            fallback_kind: state.registration.fallback.kind,
            fallback_reliability: state.registration.fallback.reliability,
        })
    }

    /// Run the primary operation with fallback routing on failure.
    ///
    /// A service already marked unavailable skips the primary entirely. A
    /// primary success marks the service available again. Unregistered
    /// services run the primary and propagate its error untouched.
    #[instrument(skip(self, ctx, primary), fields(urgent = ctx.urgent))]
    pub async fn execute_with_degradation<F, Fut>(
        &self,
        service: &str,
        ctx: &CallContext,
        primary: F,
    ) -> ResilienceResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, BoxedError>>,
    {
        if !self.is_available(service) {
            debug!(service, "Service marked unavailable, skipping primary");
            let error = ResilienceError::Unavailable { service: service.to_string() };
            return self.route_failure(service, ctx, error).await;
        }

        match primary().await {
            Ok(value) => {
                self.mark_available(service);
                Ok(value)
            }
            Err(source) => {
                let error = ResilienceError::Operation { source };
                self.route_failure(service, ctx, error).await
            }
        }
    }

    /// Route an already-failed call through the service's fallback chain.
    ///
    /// Urgent calls try the emergency fallback first. If every fallback
    /// fails, critical services get synthesized emergency guidance and the
    /// rest surface a degradation error wrapping the last fallback failure.
    /// A cancellation is the caller's own decision, not a service failure;
    /// it propagates untouched and leaves availability alone.
    pub async fn route_failure(
        &self,
        service: &str,
        ctx: &CallContext,
        error: ResilienceError,
    ) -> ResilienceResult<Value> {
        if matches!(error, ResilienceError::Cancelled) {
            debug!(service, "Call cancelled by caller, not degrading");
            return Err(error);
        }

        let (criticality, chain) = {
            let Some(state) = self.services.get(service) else {
                return Err(error);
            };
            let registration = &state.registration;
            let mut chain = Vec::with_capacity(2);
            if ctx.urgent {
                chain.extend(registration.emergency_fallback.clone());
            }
            chain.push(registration.fallback.clone());
            (registration.criticality, chain)
        };

        self.mark_unavailable(service);
        warn!(service, error = %error, "Primary path failed, degrading");

        let mut last_failure: BoxedError = Box::new(error);
        for strategy in chain {
            match strategy.run(ctx).await {
                Ok(value) => {
                    info!(service, fallback = %strategy.kind, "Serving degraded response");
                    return Ok(value);
                }
                Err(failure) => {
                    warn!(service, fallback = %strategy.kind, error = %failure, "Fallback failed");
                    last_failure = failure;
                }
            }
        }

        if criticality == Criticality::Critical {
            error!(service, "All fallbacks failed for a critical service, synthesizing emergency guidance");
            return Ok(emergency_guidance(service));
        }

        Err(ResilienceError::Degraded { service: service.to_string(), source: last_failure })
    }

    /// Spawn the background health-check loop.
    ///
    /// Critical services are probed every 15 seconds, the rest every 30.
    /// Probes that hang past a short deadline count as unhealthy.
    pub fn spawn_health_checks(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CRITICAL_PROBE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            let mut tick: u64 = 0;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Health check task stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        tick += 1;
                        // Non-critical services only every other tick.
                        self.run_probes(tick % 2 == 0).await;
                    }
                }
            }
        })
    }

    async fn run_probes(&self, include_non_critical: bool) {
        let probes: Vec<(String, HealthProbeFn)> = self
            .services
            .iter()
            .filter(|state| {
                include_non_critical || state.registration.criticality == Criticality::Critical
            })
            .filter_map(|state| {
                state
                    .registration
                    .health_probe
                    .clone()
                    .map(|probe| (state.key().clone(), probe))
            })
            .collect();

        for (service, probe) in probes {
            let healthy = tokio::time::timeout(PROBE_DEADLINE, probe())
                .await
                .unwrap_or(false);
            if healthy {
                self.mark_available(&service);
            } else {
                self.mark_unavailable(&service);
            }
        }
    }

    fn refresh_emergency_mode(&self) {
        let critical_down = self.services.iter().any(|state| {
            state.registration.criticality == Criticality::Critical
                && !state.available.load(Ordering::Acquire)
        });
        let was = self.emergency_mode.swap(critical_down, Ordering::AcqRel);
        if critical_down && !was {
            error!("Critical service unavailable, entering emergency mode");
        } else if !critical_down && was {
            info!("All critical services recovered, leaving emergency mode");
        }
    }
}

/// Last-resort payload when a critical service and all its fallbacks fail.
fn emergency_guidance(service: &str) -> Value {
    json!({
        "degraded": true,
        "emergency": true,
        "service": service,
        "guidance": "We cannot reach the guidance service right now. If your child \
                     is seriously ill or injured, call 911 or go to the nearest \
                     emergency department.",
        "instructions": [
            "Call 911 for difficulty breathing, unresponsiveness, or severe bleeding",
            "Call Poison Control at 1-800-222-1222 for suspected poisoning",
            "Use your pediatrician's after-hours line for urgent but non-emergency concerns",
        ],
    })
}
