use crate::config::{parse_memory_size, SupervisorConfig};
use crate::error::Result;
use std::time::Duration;

/// Restart policy configuration. Immutable value derived from the
/// supervisor configuration at startup.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Restart budget: maximum restarts before an instance is retired
    pub max_restarts: usize,
    /// Flat delay applied before each scheduled restart
    pub restart_delay: Duration,
    /// Uptime at or above which an exit forgives past failures
    pub min_uptime: Duration,
    /// Memory ceiling triggering a forced restart
    pub max_memory: Option<u64>,
}

impl RestartPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Result<Self> {
        let max_memory = match &config.max_memory_restart {
            Some(size) => Some(parse_memory_size(size)?),
            None => None,
        };

        Ok(Self {
            max_restarts: config.max_restarts,
            restart_delay: config.restart_delay(),
            min_uptime: config.min_uptime(),
            max_memory,
        })
    }

    /// Decide what to do after an instance exits.
    ///
    /// An exit after a stable run (uptime >= min_uptime) resets the
    /// consecutive-failure counter and does not itself count against the
    /// budget, so a long-lived instance always earns a fresh budget. A
    /// short-lived exit consumes one restart; once the budget is spent
    /// the next short exit retires the instance.
    pub fn decide_exit(&self, uptime: Duration, tracker: &mut FailureTracker) -> RestartDecision {
        if uptime >= self.min_uptime {
            tracker.reset();
        } else {
            tracker.record_failure();
        }

        if tracker.consecutive_failures() <= self.max_restarts {
            RestartDecision::Restart {
                delay: self.restart_delay,
            }
        } else {
            RestartDecision::Retire
        }
    }

    /// Decide what to do after a memory-ceiling breach. The restart
    /// bypasses the normal delay but still consumes one restart from
    /// the budget.
    pub fn decide_memory_exceeded(&self, tracker: &mut FailureTracker) -> RestartDecision {
        tracker.record_failure();

        if tracker.consecutive_failures() <= self.max_restarts {
            RestartDecision::Restart {
                delay: Duration::ZERO,
            }
        } else {
            RestartDecision::Retire
        }
    }

    /// Whether a sampled memory usage breaches the ceiling
    pub fn memory_exceeded(&self, memory_usage: u64) -> bool {
        match self.max_memory {
            Some(limit) => memory_usage > limit,
            None => false,
        }
    }
}

/// Outcome of applying the restart policy to one instance failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Relaunch the instance after the given delay
    Restart { delay: Duration },
    /// Budget exhausted: transition to Failed, never relaunch
    Retire,
}

/// Tracks consecutive failures for one instance.
///
/// Mutated only by the supervisor's control loop (single writer).
#[derive(Debug, Clone, Default)]
pub struct FailureTracker {
    consecutive_failures: usize,
    total_restarts: usize,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure against the budget
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    /// Record that a restart actually happened
    pub fn record_restart(&mut self) {
        self.total_restarts += 1;
    }

    /// Reset the consecutive-failure counter after a stable run
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }

    pub fn total_restarts(&self) -> usize {
        self.total_restarts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_restarts: usize, delay_ms: u64, min_uptime_ms: u64) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            restart_delay: Duration::from_millis(delay_ms),
            min_uptime: Duration::from_millis(min_uptime_ms),
            max_memory: None,
        }
    }

    #[test]
    fn test_short_uptime_increments_counter() {
        let policy = policy(10, 4000, 10_000);
        let mut tracker = FailureTracker::new();

        let decision = policy.decide_exit(Duration::from_secs(3), &mut tracker);
        assert_eq!(tracker.consecutive_failures(), 1);
        assert_eq!(
            decision,
            RestartDecision::Restart {
                delay: Duration::from_millis(4000)
            }
        );
    }

    #[test]
    fn test_stable_uptime_forgives_past_failures() {
        let policy = policy(10, 4000, 10_000);
        let mut tracker = FailureTracker::new();

        policy.decide_exit(Duration::from_secs(3), &mut tracker);
        policy.decide_exit(Duration::from_secs(3), &mut tracker);
        assert_eq!(tracker.consecutive_failures(), 2);

        // A stable run resets the counter and is not itself counted
        let decision = policy.decide_exit(Duration::from_secs(60), &mut tracker);
        assert_eq!(tracker.consecutive_failures(), 0);
        assert!(matches!(decision, RestartDecision::Restart { .. }));

        // The full budget is available again after the stable run
        for i in 1..=10 {
            policy.decide_exit(Duration::from_secs(3), &mut tracker);
            assert_eq!(tracker.consecutive_failures(), i);
        }
    }

    #[test]
    fn test_uptime_exactly_at_threshold_is_stable() {
        let policy = policy(10, 4000, 10_000);
        let mut tracker = FailureTracker::new();

        policy.decide_exit(Duration::from_secs(3), &mut tracker);
        policy.decide_exit(Duration::from_secs(10), &mut tracker);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn test_budget_exhaustion_retires() {
        // max_restarts=10, restart_delay=4000ms, min_uptime=10s; a crash
        // loop with 3s uptimes gets exactly 10 restarts, then retires.
        let policy = policy(10, 4000, 10_000);
        let mut tracker = FailureTracker::new();

        for i in 1..=10 {
            let decision = policy.decide_exit(Duration::from_secs(3), &mut tracker);
            assert_eq!(tracker.consecutive_failures(), i);
            assert_eq!(
                decision,
                RestartDecision::Restart {
                    delay: Duration::from_millis(4000)
                },
                "restart {} should still be within budget",
                i
            );
            tracker.record_restart();
        }

        let decision = policy.decide_exit(Duration::from_secs(3), &mut tracker);
        assert_eq!(decision, RestartDecision::Retire);
        assert_eq!(tracker.total_restarts(), 10);
    }

    #[test]
    fn test_delay_is_flat() {
        let policy = policy(10, 4000, 10_000);
        let mut tracker = FailureTracker::new();

        for _ in 0..5 {
            match policy.decide_exit(Duration::from_secs(1), &mut tracker) {
                RestartDecision::Restart { delay } => {
                    assert_eq!(delay, Duration::from_millis(4000));
                }
                RestartDecision::Retire => panic!("should not retire within budget"),
            }
        }
    }

    #[test]
    fn test_memory_exceeded_bypasses_delay() {
        let policy = policy(10, 4000, 10_000);
        let mut tracker = FailureTracker::new();

        let decision = policy.decide_memory_exceeded(&mut tracker);
        assert_eq!(
            decision,
            RestartDecision::Restart {
                delay: Duration::ZERO
            }
        );
        assert_eq!(tracker.consecutive_failures(), 1);
    }

    #[test]
    fn test_memory_ceiling_check() {
        let mut policy = policy(10, 4000, 10_000);
        policy.max_memory = Some(1024 * 1024 * 1024);

        assert!(!policy.memory_exceeded(1024 * 1024 * 1024));
        assert!(policy.memory_exceeded(1024 * 1024 * 1024 + 1));

        policy.max_memory = None;
        assert!(!policy.memory_exceeded(u64::MAX));
    }
}
