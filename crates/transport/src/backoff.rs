//! Reconnection schedule: `min(base * 2^attempt, max)` with proportional jitter.

use std::time::Duration;

use rand::Rng;
use supportdesk_config::ReconnectConfig;

use crate::state::ConnectionState;

/// What the reconnect loop should do before its next attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectDecision {
    Retry {
        delay: Duration,
        state: ConnectionState,
    },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
    suspend_after: u32,
    max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            base: config.base_delay(),
            max: config.max_delay().max(config.base_delay()),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
            suspend_after: config.suspend_after_attempts,
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before `attempt` (zero based) without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay before `attempt` with jitter applied, never above the cap
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_ratio <= f64::EPSILON {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter_ratio..=self.jitter_ratio);
        base.mul_f64(1.0 + spread).min(self.max)
    }

    pub fn decide(&self, attempt: u32) -> ReconnectDecision {
        if let Some(limit) = self.max_attempts {
            if attempt >= limit {
                return ReconnectDecision::GiveUp;
            }
        }
        let state = if attempt >= self.suspend_after {
            ConnectionState::Suspended
        } else {
            ConnectionState::Connecting
        };
        ReconnectDecision::Retry {
            delay: self.delay(attempt),
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: Option<u32>, jitter_ratio: f64) -> ReconnectPolicy {
        ReconnectPolicy::from_config(&ReconnectConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ratio,
            suspend_after_attempts: 3,
            max_attempts,
        })
    }

    #[test]
    fn base_delay_doubles_until_cap() {
        let policy = policy(None, 0.0);
        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(800));
        assert_eq!(policy.base_delay(4), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_ratio_and_cap() {
        let policy = policy(None, 0.5);
        for _ in 0..200 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(300));
            assert!(policy.delay(10) <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn decide_moves_to_suspended_after_threshold() {
        let policy = policy(None, 0.0);
        assert!(matches!(
            policy.decide(0),
            ReconnectDecision::Retry { state: ConnectionState::Connecting, .. }
        ));
        assert!(matches!(
            policy.decide(3),
            ReconnectDecision::Retry { state: ConnectionState::Suspended, .. }
        ));
        assert!(matches!(policy.decide(10_000), ReconnectDecision::Retry { .. }));
    }

    #[test]
    fn decide_gives_up_when_attempts_run_out() {
        let policy = policy(Some(2), 0.0);
        assert!(matches!(policy.decide(1), ReconnectDecision::Retry { .. }));
        assert_eq!(policy.decide(2), ReconnectDecision::GiveUp);
    }
}
