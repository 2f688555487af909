use overseer_core::BreakerConfig;
use std::time::{Duration, Instant};

/// Circuit state. `HalfOpen` tracks whether the single probe slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Dispatch permitted; failures are counted.
    Closed,
    /// Dispatch refused until the cool-down elapses.
    Open,
    /// Cool-down elapsed; exactly one trial dispatch is permitted.
    HalfOpen {
        /// True while the trial dispatch is in flight.
        probing: bool,
    },
}

/// Per-agent circuit breaker.
///
/// Transitions happen only on dispatch outcomes or on an acquire attempt
/// after the cool-down has elapsed. The caller must hold the agent's lock
/// across `try_acquire` so the half-open probe slot is handed to exactly
/// one dispatcher.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    /// Create a closed breaker from configuration.
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            failure_threshold: config.failure_threshold,
            cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether dispatch is currently refused.
    pub fn is_open(&self) -> bool {
        match self.state {
            BreakerState::Open => !self.cooldown_elapsed(),
            BreakerState::HalfOpen { probing } => probing,
            BreakerState::Closed => false,
        }
    }

    fn cooldown_elapsed(&self) -> bool {
        self.last_failure
            .map(|at| at.elapsed() >= self.cooldown)
            .unwrap_or(true)
    }

    /// Request permission for one dispatch.
    ///
    /// Returns `false` when the circuit refuses the dispatch. In the
    /// half-open window only the first caller gets the probe slot.
    pub fn try_acquire(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if self.cooldown_elapsed() {
                    self.state = BreakerState::HalfOpen { probing: true };
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen { probing } => {
                if probing {
                    false
                } else {
                    self.state = BreakerState::HalfOpen { probing: true };
                    true
                }
            }
        }
    }

    /// Release an unconsumed half-open probe slot.
    ///
    /// Called when the probing dispatch was dropped before any outcome was
    /// recorded; the slot goes back up for grabs instead of leaving the
    /// breaker stuck in its probing state.
    pub fn release_probe(&mut self) {
        if self.state == (BreakerState::HalfOpen { probing: true }) {
            self.state = BreakerState::HalfOpen { probing: false };
        }
    }

    /// Record a successful dispatch outcome.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    /// Record a failed dispatch outcome.
    ///
    /// A half-open probe failure reopens the circuit and restarts the
    /// cool-down; in the closed state the circuit opens once the
    /// consecutive-failure count reaches the threshold.
    pub fn record_failure(&mut self) {
        self.last_failure = Some(Instant::now());
        match self.state {
            BreakerState::HalfOpen { .. } => {
                self.state = BreakerState::Open;
            }
            BreakerState::Closed | BreakerState::Open => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.state = BreakerState::Open;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(&BreakerConfig {
            failure_threshold: threshold,
            cooldown_ms,
        })
    }

    #[test]
    fn opens_after_threshold_failures() {
        let mut b = breaker(3, 60_000);
        assert!(b.try_acquire());
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.try_acquire());
    }

    #[test]
    fn success_resets_failure_count() {
        let mut b = breaker(3, 60_000);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_cooldown_allows_single_probe() {
        let mut b = breaker(1, 0);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        // Zero cooldown: the next acquire transitions to half-open.
        assert!(b.try_acquire());
        assert_eq!(b.state(), BreakerState::HalfOpen { probing: true });

        // A concurrent caller during the probe window is refused.
        assert!(!b.try_acquire());
    }

    #[test]
    fn probe_success_closes_circuit() {
        let mut b = breaker(1, 0);
        b.record_failure();
        assert!(b.try_acquire());
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.try_acquire());
    }

    #[test]
    fn probe_failure_reopens_and_restarts_cooldown() {
        let mut b = breaker(1, 60_000);
        b.record_failure();
        // Force the cooldown to look elapsed.
        b.last_failure = Some(Instant::now() - Duration::from_secs(120));
        assert!(b.try_acquire());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        // Cooldown restarted: still refused.
        assert!(!b.try_acquire());
    }

    #[test]
    fn released_probe_slot_can_be_reacquired() {
        let mut b = breaker(1, 0);
        b.record_failure();
        assert!(b.try_acquire());
        assert_eq!(b.state(), BreakerState::HalfOpen { probing: true });

        // The probing dispatch was dropped without recording an outcome.
        b.release_probe();
        assert_eq!(b.state(), BreakerState::HalfOpen { probing: false });

        // The next caller gets the probe; its success closes the circuit.
        assert!(b.try_acquire());
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn release_probe_is_inert_outside_probing_state() {
        let mut b = breaker(3, 60_000);
        b.release_probe();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        b.record_failure();
        b.record_failure();
        b.release_probe();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn refuses_while_cooldown_pending() {
        let mut b = breaker(1, 60_000);
        b.record_failure();
        assert!(!b.try_acquire());
        assert!(b.is_open());
    }
}
