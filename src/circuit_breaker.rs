use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use crate::config::CircuitBreakerConfig;

/// Guards the analysis backend. Opens after consecutive backend-health failures
/// and lets a bounded number of trial calls through once the open period elapses.
#[derive(Clone)]
pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

#[derive(Debug)]
struct BreakerState {
    phase: BreakerPhase,
    consecutive_failures: u32,
    half_open_in_flight: u32,
    /// Bumped on every entry into half-open so stale permits cannot release
    /// slots belonging to a later trial round.
    half_open_round: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerPhase {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

/// Admission to call the backend. Settle it with `success`, `failure` or
/// `neutral`; dropping it unsettled (e.g. the request future was cancelled)
/// gives a half-open slot back.
#[must_use]
pub struct BreakerPermit {
    breaker: CircuitBreaker,
    trial_round: Option<u64>,
    settled: bool,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg,
            state: Arc::new(Mutex::new(BreakerState {
                phase: BreakerPhase::Closed,
                consecutive_failures: 0,
                half_open_in_flight: 0,
                half_open_round: 0,
            })),
        }
    }

    /// `Err(retry_after_secs)` while the breaker rejects calls.
    pub fn try_acquire(&self) -> Result<BreakerPermit, u64> {
        let mut state = self.state.lock();
        let now = Instant::now();

        let trial_round = match state.phase {
            BreakerPhase::Closed => None,
            BreakerPhase::Open { until } => {
                if now < until {
                    return Err(until.duration_since(now).as_secs().max(1));
                }
                state.phase = BreakerPhase::HalfOpen;
                state.half_open_round += 1;
                state.half_open_in_flight = 1;
                Some(state.half_open_round)
            }
            BreakerPhase::HalfOpen => {
                if state.half_open_in_flight >= self.cfg.half_open_max_requests {
                    return Err(1);
                }
                state.half_open_in_flight += 1;
                Some(state.half_open_round)
            }
        };

        Ok(BreakerPermit {
            breaker: self.clone(),
            trial_round,
            settled: false,
        })
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        if state.phase == BreakerPhase::HalfOpen {
            tracing::info!("analysis backend recovered; circuit closed");
        }
        state.phase = BreakerPhase::Closed;
        state.consecutive_failures = 0;
        state.half_open_in_flight = 0;
    }

    fn on_failure(&self) {
        let mut state = self.state.lock();
        let open_for = Duration::from_secs(self.cfg.open_seconds);

        match state.phase {
            BreakerPhase::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.cfg.failure_threshold {
                    tracing::warn!(
                        failures = state.consecutive_failures,
                        open_seconds = self.cfg.open_seconds,
                        "analysis backend failing; circuit opened"
                    );
                    state.phase = BreakerPhase::Open {
                        until: Instant::now() + open_for,
                    };
                    state.consecutive_failures = 0;
                    state.half_open_in_flight = 0;
                }
            }
            BreakerPhase::HalfOpen => {
                state.phase = BreakerPhase::Open {
                    until: Instant::now() + open_for,
                };
                state.consecutive_failures = 0;
                state.half_open_in_flight = 0;
            }
            BreakerPhase::Open { .. } => {}
        }
    }

    fn release_trial_slot(&self, round: u64) {
        let mut state = self.state.lock();
        if state.phase == BreakerPhase::HalfOpen && state.half_open_round == round {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }
}

impl BreakerPermit {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure();
    }

    /// Outcome says nothing about backend health (e.g. a 4xx).
    pub fn neutral(self) {}
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(round) = self.trial_round {
            self.breaker.release_trial_slot(round);
        }
    }
}
