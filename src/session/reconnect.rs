use std::time::Duration;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// When to retry a lost stream connection.
///
/// Fixed backoff; `max_attempts: None` retries until the session is stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::unbounded(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    pub fn unbounded(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    pub fn bounded(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: Some(max_attempts),
        }
    }

    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// policy is exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt > max => None,
            _ => Some(self.delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_policy_never_gives_up() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.next_delay(1), Some(DEFAULT_RECONNECT_DELAY));
        assert_eq!(policy.next_delay(10_000), Some(DEFAULT_RECONNECT_DELAY));
    }

    #[test]
    fn bounded_policy_stops_after_limit() {
        let policy = ReconnectPolicy::bounded(Duration::from_millis(250), 2);
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(250)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(250)));
        assert_eq!(policy.next_delay(3), None);
        assert_eq!(ReconnectPolicy::bounded(policy.delay, 0).next_delay(1), None);
    }
}
