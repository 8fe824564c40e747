// Per-provider circuit breaker
//
// A provider that keeps failing is skipped for a cool-down period; the
// translation stage then falls back to the original text without spending
// a network round-trip. After the cool-down a single probe request is let
// through and its outcome decides whether the circuit closes again.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: usize,
    /// Time spent open before a probe is allowed
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: &'static str,
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub total_failures: u64,
    pub total_successes: u64,
    pub rejected: u64,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    total_failures: u64,
    total_successes: u64,
    rejected: u64,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                total_failures: 0,
                total_successes: 0,
                rejected: 0,
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether a call may go out now. In half-open state only one probe is admitted.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();

        let allowed = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cool_down)
                    .unwrap_or(true);
                if cooled {
                    info!("Circuit for {} half-open, sending probe", self.name);
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                }
                cooled
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        };

        if !allowed {
            inner.rejected += 1;
        }
        allowed
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;

        if inner.state != CircuitState::Closed {
            info!("Circuit for {} closed after successful probe", self.name);
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        inner.probe_in_flight = false;

        let trip = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if trip {
            warn!(
                "Circuit for {} opened after {} consecutive failures",
                self.name, inner.consecutive_failures
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            rejected: inner.rejected,
        }
    }
}
