use super::transport::NORMAL_CLOSURE;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Normal closure or intentional teardown
    Ignore,
    /// Try again after the delay
    Retry(Duration),
    /// Budget exhausted; fail the session
    GiveUp,
}

/// Bounded retry bookkeeping for one session.
///
/// Each unexpected failure consumes one unit of budget. The budget is
/// restored only once a reconnected link proves healthy, so two failures in
/// a row end the session.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    delay: Duration,
    budget: u32,
    consecutive_failures: u32,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration, budget: u32) -> Self {
        Self {
            delay,
            budget,
            consecutive_failures: 0,
        }
    }

    /// One retry per failure streak
    pub fn single(delay: Duration) -> Self {
        Self::new(delay, 1)
    }

    pub fn on_close(&mut self, code: u16, stopping: bool) -> ReconnectDecision {
        if stopping || code == NORMAL_CLOSURE {
            return ReconnectDecision::Ignore;
        }
        self.on_failure()
    }

    /// A failed reconnect attempt or a transport failure
    pub fn on_failure(&mut self) -> ReconnectDecision {
        self.consecutive_failures += 1;
        if self.consecutive_failures > self.budget {
            ReconnectDecision::GiveUp
        } else {
            ReconnectDecision::Retry(self.delay)
        }
    }

    /// The link carried traffic again
    pub fn mark_healthy(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn attempts_used(&self) -> u32 {
        self.consecutive_failures.min(self.budget)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::single(Duration::from_secs(5))
    }
}
