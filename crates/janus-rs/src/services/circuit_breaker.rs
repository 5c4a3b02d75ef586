//! Circuit breaker: fast failure for degraded targets.
//!
//! One breaker per key (an upstream `host:port`, or a worker id). The state
//! machine follows the classic transitions: `Closed` opens after N
//! consecutive failures, `Open` admits a single probe once the reset timeout
//! has elapsed, `HalfOpen` closes on a successful probe and reopens on a
//! failed one. While `Open`, calls fail in microseconds without touching
//! the target.

use log::{info, warn};
use parking_lot::RwLock as SyncRwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    /// Normal operation, requests pass through.
    Closed = 0,
    /// Tripped; requests fail fast.
    Open = 1,
    /// Probing recovery with a single request.
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Breaker thresholds and timing.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u64,
    /// How long the circuit stays open before a half-open probe.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Error surface of [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open; the operation was never attempted.
    #[error("Circuit breaker is open")]
    CircuitOpen,
    /// The operation ran and failed; the failure fed the breaker.
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

/// A single breaker.
///
/// Hot-path checks are atomics; the open-transition timestamp sits behind a
/// short-critical-section lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    /// Set while a half-open probe is in flight so only one request tests
    /// the target.
    probe_in_flight: AtomicBool,
    opened_at: SyncRwLock<Option<Instant>>,
    last_used: SyncRwLock<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            name,
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            opened_at: SyncRwLock::new(None),
            last_used: SyncRwLock::new(Instant::now()),
        })
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Relaxed))
    }

    pub fn failure_count(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Runs `operation` under breaker protection.
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        *self.last_used.write() = Instant::now();

        if !self.try_acquire() {
            return Err(CircuitBreakerError::CircuitOpen);
        }

        match operation.await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(error) => {
                self.on_failure();
                Err(CircuitBreakerError::OperationFailed(error))
            }
        }
    }

    /// Admission decision. `Closed` always admits; `Open` admits exactly one
    /// caller once the reset timeout elapsed, flipping to `HalfOpen`.
    fn try_acquire(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .read()
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if !elapsed {
                    return false;
                }
                // One winner becomes the probe.
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.state
                        .store(CircuitState::HalfOpen as u8, Ordering::SeqCst);
                    info!("Circuit breaker {} half-open, probing", self.name);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                // A probe is already out; everyone else fails fast.
                self.probe_in_flight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            }
        }
    }

    /// Feeds an externally observed success (used when the operation runs
    /// outside [`call`], e.g. inside a retry loop).
    pub fn on_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {
                self.state
                    .store(CircuitState::Closed as u8, Ordering::SeqCst);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.probe_in_flight.store(false, Ordering::SeqCst);
                *self.opened_at.write() = None;
                info!("Circuit breaker {} closed, target recovered", self.name);
            }
            CircuitState::Open => {}
        }
    }

    /// Feeds an externally observed failure.
    pub fn on_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.config.failure_threshold {
                    self.trip();
                }
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight.store(false, Ordering::SeqCst);
                self.trip();
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
        *self.opened_at.write() = Some(Instant::now());
        warn!("Circuit breaker {} opened", self.name);
    }

    fn idle_for(&self) -> Duration {
        self.last_used.read().elapsed()
    }
}

/// Lazily-populated breaker registry keyed by target.
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: SyncRwLock<HashMap<String, Arc<CircuitBreaker>>>,
    /// Breakers idle beyond this are dropped by [`gc`](BreakerRegistry::gc).
    idle_ttl: Duration,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: SyncRwLock::new(HashMap::new()),
            idle_ttl: Duration::from_secs(600),
        }
    }

    /// Returns the breaker for `key`, creating it on first use.
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(key) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(key.to_string())
                .or_insert_with(|| CircuitBreaker::new(key.to_string(), self.config.clone())),
        )
    }

    /// Drops breakers that have not been used for the idle interval.
    pub fn gc(&self) {
        self.breakers
            .write()
            .retain(|_, breaker| breaker.idle_for() < self.idle_ttl);
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}
