//! Circuit breaker isolating the remote HTTP backend.
//!
//! Tracks consecutive failed tries. At the threshold the circuit opens and
//! remote attempts are short-circuited until the cooldown passes; the first
//! attempt after the cooldown runs as a half-open probe.

use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    failure_threshold: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            cooldown,
            opened_at: None,
            next_attempt_at: None,
        }
    }

    /// Gate one attempt. In `Open` before `next_attempt_at` this fails with
    /// the remaining wait; the first attempt at or after `next_attempt_at`
    /// transitions to `HalfOpen` and is allowed through as the single probe.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let next = self.next_attempt_at.unwrap_or(now);
                if now >= next {
                    self.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(next - now)
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.next_attempt_at = None;
    }

    /// Record one overall try that exhausted its retries. A half-open probe
    /// failure reopens with a fresh cooldown.
    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::HalfOpen => self.trip(now),
            _ => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.failure_threshold {
                    self.trip(now);
                }
            }
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.next_attempt_at = Some(now + self.cooldown);
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn next_attempt_in(&self, now: Instant) -> Option<Duration> {
        match self.state {
            CircuitState::Open => self
                .next_attempt_at
                .map(|at| at.saturating_duration_since(now)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed_and_allows_attempts() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(30));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire(Instant::now()).is_ok());
    }

    #[test]
    fn opens_at_threshold() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new(2, Duration::from_secs(30));
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire(now).is_err());
        assert!(cb.next_attempt_in(now).is_some());
    }

    #[test]
    fn half_open_probe_after_cooldown() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(100));
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);

        let later = now + Duration::from_millis(150);
        assert!(cb.try_acquire(later).is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_cooldown() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(100));
        cb.record_failure(now);
        let probe_at = now + Duration::from_millis(150);
        cb.try_acquire(probe_at).expect("probe allowed");
        cb.record_failure(probe_at);
        assert_eq!(cb.state(), CircuitState::Open);
        let wait = cb
            .next_attempt_in(probe_at)
            .expect("fresh cooldown armed");
        assert!(wait >= Duration::from_millis(90));
    }

    #[test]
    fn half_open_success_closes_and_resets() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(10));
        cb.record_failure(now);
        cb.try_acquire(now + Duration::from_millis(20)).expect("probe");
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.try_acquire(now + Duration::from_millis(30)).is_ok());
    }
}
