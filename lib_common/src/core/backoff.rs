//! # Reconnect Backoff
//!
//! Bounded exponential backoff for the upstream connector:
//! `delay = min(initial_delay * 2^attempt, max_delay)`, with a hard cap on the number of
//! attempts after which the connector gives up for good.

use std::time::Duration;

/// Tunables for reconnecting to the upstream feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Number of reconnects scheduled before the connector is declared `failed`.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            max_attempts: 5,
        }
    }
}

/// Delay before reconnect number `attempt` (zero based). Saturates at `max_delay`.
pub fn backoff_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| policy.initial_delay.checked_mul(factor))
        .map_or(policy.max_delay, |delay| delay.min(policy.max_delay))
}

/// Attempt counter. Non-decreasing while failures persist, reset only on a successful open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectState {
    attempt_count: u32,
}

impl ReconnectState {
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Delay for the next reconnect, or `None` once the policy's attempts are used up.
    pub fn next_delay(&mut self, policy: &ReconnectPolicy) -> Option<Duration> {
        if self.attempt_count >= policy.max_attempts {
            return None;
        }
        let delay = backoff_delay(policy, self.attempt_count);
        self.attempt_count += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_caps_at_max_delay() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u128> = (0..6).map(|a| backoff_delay(&policy, a).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000]);
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(backoff_delay(&policy, 40), policy.max_delay);
        assert_eq!(backoff_delay(&policy, u32::MAX), policy.max_delay);
    }

    #[test]
    fn test_state_exhausts_after_max_attempts() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::default()
        };
        let mut state = ReconnectState::default();

        assert_eq!(state.next_delay(&policy), Some(Duration::from_millis(1000)));
        assert_eq!(state.next_delay(&policy), Some(Duration::from_millis(2000)));
        assert_eq!(state.next_delay(&policy), Some(Duration::from_millis(4000)));
        assert_eq!(state.attempt_count(), 3);

        // Exhausted: stays exhausted and the counter does not move.
        assert_eq!(state.next_delay(&policy), None);
        assert_eq!(state.next_delay(&policy), None);
        assert_eq!(state.attempt_count(), 3);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let policy = ReconnectPolicy::default();
        let mut state = ReconnectState::default();
        state.next_delay(&policy);
        state.next_delay(&policy);
        state.reset();
        assert_eq!(state.attempt_count(), 0);
        assert_eq!(state.next_delay(&policy), Some(policy.initial_delay));
    }
}
