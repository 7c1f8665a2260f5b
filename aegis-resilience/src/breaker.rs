//! Per-dependency circuit breakers with lock-free state snapshots.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ResilienceError;

/// Breaker tuning knobs, shared by every breaker a registry creates unless
/// overridden per dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip CLOSED → OPEN.
    pub failure_threshold: u32,

    /// Rolling failure rate (0..1) over the window that also trips OPEN.
    pub failure_rate_threshold: f64,

    /// Rolling window for failure-rate accounting.
    pub window: Duration,

    /// Minimum observations in the window before the rate can trip.
    pub min_window_calls: u32,

    /// How long OPEN lasts before HALF_OPEN probing begins.
    pub cooldown: Duration,

    /// Concurrent probes admitted while HALF_OPEN; all must succeed to
    /// close the breaker, any failure reopens it.
    pub halfopen_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            window: Duration::from_secs(60),
            min_window_calls: 10,
            cooldown: Duration::from_secs(30),
            halfopen_probes: 3,
        }
    }
}

/// Breaker states. Stored as an atomic word so health queries never take
/// the transition lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => BreakerState::Closed,
            1 => BreakerState::Open,
            _ => BreakerState::HalfOpen,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

/// Point-in-time breaker health, readable without locking.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_rate: f64,
    pub transitions: u64,
}

struct BreakerInner {
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    probe_successes: u32,
}

/// Three-state fault isolation for one external dependency.
pub struct CircuitBreaker {
    dependency: String,
    config: BreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    failure_rate_bits: AtomicU64,
    transitions: AtomicU64,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(dependency: &str, config: BreakerConfig) -> Self {
        Self {
            dependency: dependency.to_string(),
            config,
            state: AtomicU8::new(BreakerState::Closed.as_u8()),
            consecutive_failures: AtomicU32::new(0),
            failure_rate_bits: AtomicU64::new(0f64.to_bits()),
            transitions: AtomicU64::new(0),
            inner: Mutex::new(BreakerInner {
                window: VecDeque::new(),
                opened_at: None,
                probes_in_flight: 0,
                probe_successes: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            dependency: self.dependency.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            failure_rate: f64::from_bits(self.failure_rate_bits.load(Ordering::Relaxed)),
            transitions: self.transitions.load(Ordering::Relaxed),
        }
    }

    /// Admit one call. While OPEN this fails fast with `CircuitOpen`;
    /// while HALF_OPEN only the configured probe budget is admitted.
    /// The returned permit must be resolved with
    /// [`BreakerPermit::success`] or [`BreakerPermit::failure`].
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, ResilienceError> {
        let mut inner = self.inner.lock();
        match self.state() {
            BreakerState::Closed => Ok(BreakerPermit::new(self.clone(), false)),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed < self.config.cooldown {
                    return Err(ResilienceError::CircuitOpen {
                        dependency: self.dependency.clone(),
                    });
                }
                self.transition(&mut inner, BreakerState::HalfOpen);
                inner.probes_in_flight = 1;
                inner.probe_successes = 0;
                Ok(BreakerPermit::new(self.clone(), true))
            }
            BreakerState::HalfOpen => {
                if inner.probes_in_flight >= self.config.halfopen_probes {
                    return Err(ResilienceError::CircuitOpen {
                        dependency: self.dependency.clone(),
                    });
                }
                inner.probes_in_flight += 1;
                Ok(BreakerPermit::new(self.clone(), true))
            }
        }
    }

    /// Force the breaker back to CLOSED. Restricted self-healing action
    /// used by the meta-health monitor.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.window.clear();
        inner.opened_at = None;
        inner.probes_in_flight = 0;
        inner.probe_successes = 0;
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.failure_rate_bits.store(0f64.to_bits(), Ordering::Relaxed);
        self.transition(&mut inner, BreakerState::Closed);
        warn!(dependency = %self.dependency, "breaker manually reset");
    }

    fn record(&self, probe: bool, ok: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.window.push_back((now, ok));
        let horizon = self.config.window;
        while let Some((t, _)) = inner.window.front() {
            if now.duration_since(*t) > horizon {
                inner.window.pop_front();
            } else {
                break;
            }
        }

        let failures = inner.window.iter().filter(|(_, ok)| !ok).count() as f64;
        let total = inner.window.len() as f64;
        let rate = if total > 0.0 { failures / total } else { 0.0 };
        self.failure_rate_bits.store(rate.to_bits(), Ordering::Relaxed);

        if ok {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }

        match self.state() {
            BreakerState::Closed => {
                let consecutive = self.consecutive_failures.load(Ordering::Relaxed);
                let rate_tripped = inner.window.len() as u32 >= self.config.min_window_calls
                    && rate >= self.config.failure_rate_threshold;
                if !ok && (consecutive >= self.config.failure_threshold || rate_tripped) {
                    inner.opened_at = Some(now);
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen if probe => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                if !ok {
                    inner.opened_at = Some(now);
                    inner.probe_successes = 0;
                    self.transition(&mut inner, BreakerState::Open);
                } else {
                    inner.probe_successes += 1;
                    if inner.probe_successes >= self.config.halfopen_probes {
                        inner.opened_at = None;
                        self.transition(&mut inner, BreakerState::Closed);
                    }
                }
            }
            _ => {}
        }
    }

    fn cancel_probe(&self, probe: bool) {
        if probe {
            let mut inner = self.inner.lock();
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    fn transition(&self, _inner: &mut BreakerInner, to: BreakerState) {
        let from = self.state();
        if from == to {
            return;
        }
        self.state.store(to.as_u8(), Ordering::Release);
        self.transitions.fetch_add(1, Ordering::Relaxed);
        match to {
            BreakerState::Open => warn!(dependency = %self.dependency, ?from, "breaker opened"),
            BreakerState::HalfOpen => {
                info!(dependency = %self.dependency, "breaker half-open, probing")
            }
            BreakerState::Closed => info!(dependency = %self.dependency, "breaker closed"),
        }
    }
}

/// Outcome handle for one admitted call.
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    resolved: bool,
}

impl BreakerPermit {
    fn new(breaker: Arc<CircuitBreaker>, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            resolved: false,
        }
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record(self.probe, true);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record(self.probe, false);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        // An unresolved permit (cancelled call) releases its probe slot
        // without counting as an observation.
        if !self.resolved {
            self.breaker.cancel_probe(self.probe);
        }
    }
}

/// Process-wide breaker registry, one breaker per dependency name.
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                debug!(dependency, "registering circuit breaker");
                Arc::new(CircuitBreaker::new(dependency, self.default_config.clone()))
            })
            .clone()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.iter().map(|entry| entry.snapshot()).collect()
    }

    /// Count of breakers currently not CLOSED.
    pub fn unhealthy_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|e| e.state() != BreakerState::Closed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            failure_rate_threshold: 0.5,
            window: Duration::from_secs(60),
            min_window_calls: 100,
            cooldown: Duration::from_millis(0),
            halfopen_probes: 2,
        }
    }

    fn trip(breaker: &Arc<CircuitBreaker>) {
        for _ in 0..3 {
            breaker.try_acquire().unwrap().failure();
        }
    }

    #[test]
    fn consecutive_failures_open_the_breaker() {
        let breaker = Arc::new(CircuitBreaker::new("model", fast_config()));
        breaker.try_acquire().unwrap().failure();
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn success_resets_the_consecutive_count() {
        let breaker = Arc::new(CircuitBreaker::new("model", fast_config()));
        breaker.try_acquire().unwrap().failure();
        breaker.try_acquire().unwrap().failure();
        breaker.try_acquire().unwrap().success();
        breaker.try_acquire().unwrap().failure();
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn open_breaker_fails_fast_until_cooldown() {
        let mut config = fast_config();
        config.cooldown = Duration::from_secs(3600);
        let breaker = Arc::new(CircuitBreaker::new("memory", config));
        trip(&breaker);

        assert!(matches!(
            breaker.try_acquire(),
            Err(ResilienceError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn all_probes_succeeding_closes_the_breaker() {
        let breaker = Arc::new(CircuitBreaker::new("model", fast_config()));
        trip(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);

        // Zero cooldown: next acquire starts probing.
        let p1 = breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        let p2 = breaker.try_acquire().unwrap();

        // Probe budget exhausted while both are in flight.
        assert!(breaker.try_acquire().is_err());

        p1.success();
        p2.success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn any_probe_failure_reopens() {
        let breaker = Arc::new(CircuitBreaker::new("model", fast_config()));
        trip(&breaker);

        let probe = breaker.try_acquire().unwrap();
        probe.failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn dropped_permit_releases_probe_slot() {
        let breaker = Arc::new(CircuitBreaker::new("model", fast_config()));
        trip(&breaker);

        let probe = breaker.try_acquire().unwrap();
        drop(probe);
        // Slot released: another probe is admitted.
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn registry_reuses_and_snapshots() {
        let registry = BreakerRegistry::new(fast_config());
        let a = registry.get("model");
        let b = registry.get("model");
        assert!(Arc::ptr_eq(&a, &b));

        trip(&a);
        assert_eq!(registry.unhealthy_count(), 1);
        let snapshot = &registry.snapshots()[0];
        assert_eq!(snapshot.state, BreakerState::Open);
        assert_eq!(snapshot.dependency, "model");
    }
}
