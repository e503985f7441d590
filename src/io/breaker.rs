//! Circuit breaker for the ingest sink
//!
//! State and failure counter live under one mutex so transitions are
//! atomic with the count that caused them. Each permit settles once, so
//! the counter tracks calls, not individual retry attempts.
//!
//! ```text
//! CLOSED --(threshold consecutive failed calls)-----> OPEN
//! OPEN   --(first call after cool-down)-------------> HALF_OPEN (one probe)
//! HALF_OPEN --probe ok--> CLOSED     HALF_OPEN --probe failed--> OPEN
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    /// Gauge value (0=closed, 1=open, 2=half_open)
    pub fn gauge(&self) -> u64 {
        match self {
            BreakerState::Closed => crate::infra::metrics::BREAKER_STATE_CLOSED,
            BreakerState::Open => crate::infra::metrics::BREAKER_STATE_OPEN,
            BreakerState::HalfOpen => crate::infra::metrics::BREAKER_STATE_HALF_OPEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    /// When the next probe will be admitted (only while open)
    pub next_probe_at: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Outcome of asking the breaker for admission
pub enum Admission<'a> {
    Allowed(Permit<'a>),
    /// Open, or a probe is already in flight
    Rejected,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state without triggering the open -> half-open transition
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            next_probe_at: match inner.state {
                BreakerState::Open => inner.opened_at.map(|t| t + self.config.cooldown),
                _ => None,
            },
        }
    }

    /// Admit a call. The first call after cool-down becomes the single probe.
    pub fn try_acquire(&self) -> Admission<'_> {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> Admission<'_> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Admission::Allowed(Permit::new(self, false)),
            BreakerState::Open => {
                let cooled = inner.opened_at.map_or(true, |t| now >= t + self.config.cooldown);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("breaker_half_open");
                    Admission::Allowed(Permit::new(self, true))
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::Allowed(Permit::new(self, true))
                }
            }
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        match (inner.state, probe) {
            (BreakerState::HalfOpen, true) => {
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                info!("breaker_closed");
            }
            (BreakerState::Closed, _) => inner.consecutive_failures = 0,
            // Late result from a call admitted before the trip
            _ => {}
        }
    }

    /// Returns true if this failure opened the breaker
    fn on_failure(&self, probe: bool, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(now);
        match (inner.state, probe) {
            (BreakerState::HalfOpen, true) => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
                warn!(cooldown_ms = self.config.cooldown.as_millis() as u64, "breaker_reopened");
                true
            }
            (BreakerState::Closed, _) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        consecutive_failures = inner.consecutive_failures,
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "breaker_opened"
                    );
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

/// Admission ticket for one call.
///
/// A probe permit dropped without a recorded outcome (caller timeout,
/// cancelled future) counts as a failed probe so the breaker re-opens
/// instead of staying half-open forever.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self { breaker, probe, settled: false }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Sink reachable (2xx or 4xx)
    pub fn record_success(&mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    /// Call exhausted its attempts on 5xx/transport errors; true if the
    /// breaker is now open
    pub fn record_failure(&mut self) -> bool {
        self.settled = true;
        self.breaker.on_failure(self.probe, Instant::now())
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.on_failure(true, Instant::now());
        }
    }
}
