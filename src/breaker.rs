//! Circuit breaker guarding the sync ledger
//!
//! One breaker instance is shared across all concurrent ledger operations.
//! The closed state counts outcomes over a rolling window; tripping opens the
//! breaker for a cooldown, after which a bounded number of half-open probes
//! decide whether to close again. One logical operation (including its whole
//! retry loop) is one count.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

/// Tunable thresholds for [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Requests allowed through while half-open; this many consecutive
    /// successes close the breaker.
    pub max_probes: u32,
    /// Closed-state counts are cleared on this cadence.
    pub interval: Duration,
    /// How long the breaker stays open before probing.
    pub cooldown: Duration,
    /// Minimum requests in the window before the ratio is consulted.
    pub min_requests: u32,
    /// Failure ratio at or above which the breaker trips.
    pub failure_ratio: f64,
}

impl BreakerSettings {
    pub const DEFAULT_MAX_PROBES: u32 = 5;
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(15);
    pub const DEFAULT_MIN_REQUESTS: u32 = 5;
    pub const DEFAULT_FAILURE_RATIO: f64 = 0.30;
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_probes: Self::DEFAULT_MAX_PROBES,
            interval: Self::DEFAULT_INTERVAL,
            cooldown: Self::DEFAULT_COOLDOWN,
            min_requests: Self::DEFAULT_MIN_REQUESTS,
            failure_ratio: Self::DEFAULT_FAILURE_RATIO,
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

/// Returned when a call is short-circuited without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerOpen;

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    requests: u32,
    failures: u32,
    consecutive_successes: u32,
}

impl Counts {
    fn clear(&mut self) {
        *self = Counts::default();
    }
}

struct Inner {
    state: BreakerState,
    counts: Counts,
    /// Window start while closed; open instant while open.
    since: Instant,
    /// Bumped on every transition so stale results are discarded.
    generation: u64,
}

/// Shared stateful guard that short-circuits calls when recent failures
/// exceed the configured threshold.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                counts: Counts::default(),
                since: Instant::now(),
                generation: 0,
            }),
        }
    }

    /// Current state, refreshing any due open→half-open transition first.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Ask permission to run one logical operation.
    ///
    /// On success returns a generation tag that must be passed back to
    /// [`CircuitBreaker::record`].
    pub fn try_acquire(&self) -> Result<u64, BreakerOpen> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let now = Instant::now();
        self.refresh(&mut inner, now);

        match inner.state {
            BreakerState::Open => Err(BreakerOpen),
            BreakerState::HalfOpen if inner.counts.requests >= self.settings.max_probes => {
                Err(BreakerOpen)
            }
            _ => {
                inner.counts.requests += 1;
                Ok(inner.generation)
            }
        }
    }

    /// Report the outcome of an operation admitted by
    /// [`CircuitBreaker::try_acquire`]. Outcomes from before a state
    /// transition are ignored.
    pub fn record(&self, generation: u64, success: bool) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let now = Instant::now();
        self.refresh(&mut inner, now);
        if inner.generation != generation {
            return;
        }

        if success {
            inner.counts.consecutive_successes += 1;
            if inner.state == BreakerState::HalfOpen
                && inner.counts.consecutive_successes >= self.settings.max_probes
            {
                self.transition(&mut inner, BreakerState::Closed, now);
            }
        } else {
            inner.counts.failures += 1;
            inner.counts.consecutive_successes = 0;
            match inner.state {
                BreakerState::HalfOpen => self.transition(&mut inner, BreakerState::Open, now),
                BreakerState::Closed if self.should_trip(&inner.counts) => {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
                _ => {}
            }
        }
    }

    fn should_trip(&self, counts: &Counts) -> bool {
        counts.requests >= self.settings.min_requests
            && f64::from(counts.failures) / f64::from(counts.requests)
                >= self.settings.failure_ratio
    }

    /// Apply time-driven transitions: open→half-open after the cooldown,
    /// and closed-state count window resets.
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            BreakerState::Open => {
                if now.duration_since(inner.since) >= self.settings.cooldown {
                    self.transition(inner, BreakerState::HalfOpen, now);
                }
            }
            BreakerState::Closed => {
                if now.duration_since(inner.since) >= self.settings.interval {
                    inner.counts.clear();
                    inner.since = now;
                }
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.counts.clear();
        inner.since = now;
        inner.generation += 1;
        info!(breaker = %self.name, %from, %to, "circuit breaker state change");
    }
}
