//! Pacing for the two waiting loops: spot allocation and address association.
//!
//! Both default to unbounded. `None` limits mean the loop only ends when the
//! provider cooperates or the process is killed.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep before every state query.
    pub interval: Duration,
    /// Extra sleep after a query that did not find the request active.
    pub pending_delay: Duration,
    pub max_polls: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            interval: Duration::from_secs(1),
            pending_delay: Duration::from_secs(10),
            max_polls: None,
        }
    }
}

impl PollPolicy {
    pub fn with_max_polls(mut self, max_polls: Option<u32>) -> Self {
        self.max_polls = max_polls;
        self
    }

    /// Whether poll number `poll` (1-based) may run.
    pub fn allows(&self, poll: u32) -> bool {
        self.max_polls.map_or(true, |max| poll <= max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed delay between attempts, no backoff.
    pub delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            delay: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Whether another attempt may follow `attempts` failed ones.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_unbounded() {
        let poll = PollPolicy::default();
        assert_eq!(poll.interval, Duration::from_secs(1));
        assert_eq!(poll.pending_delay, Duration::from_secs(10));
        assert!(poll.allows(u32::MAX));

        let retry = RetryPolicy::default();
        assert_eq!(retry.delay, Duration::from_secs(5));
        assert!(retry.should_retry(u32::MAX));
    }

    #[test]
    fn limits_are_inclusive_of_the_last_attempt() {
        let poll = PollPolicy::default().with_max_polls(Some(3));
        assert!(poll.allows(3));
        assert!(!poll.allows(4));

        let retry = RetryPolicy::default().with_max_attempts(Some(2));
        assert!(retry.should_retry(1));
        assert!(!retry.should_retry(2));
    }
}
