//! Bounded exponential backoff for re-opening a dropped transport.

use std::time::Duration;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    base: Duration,
    factor: f64,
    cap: Duration,
}

impl ReconnectPolicy {
    pub fn new(cfg: &ReconnectConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base: Duration::from_millis(cfg.base_delay_ms),
            factor: cfg.factor.max(1.0),
            cap: Duration::from_millis(cfg.max_delay_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before attempt `attempt` (1-based), or `None` once attempts are exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let scale = self.factor.powi(attempt as i32 - 1);
        let secs = (self.base.as_secs_f64() * scale).min(self.cap.as_secs_f64());
        Some(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_base_and_stops_after_max() {
        let policy = ReconnectPolicy::new(&ReconnectConfig::default());
        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.delay(n).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(policy.delay(6), None);
        assert_eq!(policy.delay(0), None);
    }

    #[test]
    fn delay_is_capped() {
        let policy = ReconnectPolicy::new(&ReconnectConfig {
            max_attempts: 10,
            base_delay_ms: 1000,
            factor: 2.0,
            max_delay_ms: 30_000,
        });
        assert_eq!(policy.delay(6), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay(10), Some(Duration::from_secs(30)));
    }
}
