//! Reconnection policies.

use std::fmt;
use std::time::Duration;

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Decides whether and when the client retries a lost connection.
pub trait ReconnectPolicy: fmt::Debug + Send + Sync + 'static {
    /// Delay before reconnect attempt `attempt` (1-based). `None` gives up.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Same delay before every attempt, optionally capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_INTERVAL)
    }
}

impl FixedBackoff {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl ReconnectPolicy for FixedBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt > max => None,
            _ => Some(self.interval),
        }
    }
}

/// Never reconnect; the next request performs its own handshake.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReconnect;

impl ReconnectPolicy for NoReconnect {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_defaults_to_unlimited() {
        let policy = FixedBackoff::default();
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(5)));
        assert_eq!(policy.next_delay(10_000), Some(Duration::from_secs(5)));
    }

    #[test]
    fn fixed_backoff_gives_up_after_cap() {
        let policy = FixedBackoff::new(Duration::from_millis(10)).with_max_attempts(2);
        assert!(policy.next_delay(2).is_some());
        assert!(policy.next_delay(3).is_none());
    }

    #[test]
    fn no_reconnect_never_retries() {
        assert!(NoReconnect.next_delay(1).is_none());
    }
}
