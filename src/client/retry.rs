//! Reconnect timing for tunnel workers.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::debug;

/// How long a worker waits before dialing the relay again.
///
/// The default is a fixed 3 second interval with no jitter and no limit on
/// the number of attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Base wait between attempts
    pub interval: Duration,
    /// Upper bound of the random extra wait added to each attempt
    pub jitter: Duration,
    /// Consecutive failures after which the worker gives up, `None` for never
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(3))
    }
}

impl RetryPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            jitter: Duration::ZERO,
            max_attempts: None,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay to apply before the next attempt
    pub fn delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }
        let max_extra = self.jitter.as_millis() as u64;
        let extra = rand::thread_rng().gen_range(0..=max_extra);
        self.interval + Duration::from_millis(extra)
    }
}

/// Retry state for one worker: counts consecutive failed attempts.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Sleep for the policy's delay and record one more failed attempt
    pub async fn wait(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.policy.delay();
        debug!(
            "Waiting {}ms before reconnection attempt {}",
            delay.as_millis(),
            self.attempt
        );
        sleep(delay).await;
        delay
    }

    /// Forget past failures, after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the policy's attempt limit has been used up
    pub fn exhausted(&self) -> bool {
        self.policy
            .max_attempts
            .is_some_and(|max| self.attempt >= max)
    }
}
