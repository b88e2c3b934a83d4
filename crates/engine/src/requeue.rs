use std::time::Duration;

use keel_config::EngineSettings;
use keel_core::RetryableError;
use rand::Rng;

/// Picks the delay before the next pass. Backoff across failed passes belongs to the
/// outer scheduler; this only spreads re-checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeuePolicy {
    pub min: Duration,
    pub max: Duration,
}

impl Default for RequeuePolicy {
    fn default() -> Self { Self { min: Duration::from_secs(3), max: Duration::from_secs(5) } }
}

impl RequeuePolicy {
    pub fn from_settings(s: &EngineSettings) -> Self { Self { min: s.requeue_min, max: s.requeue_max.max(s.requeue_min) } }

    /// `None` when nothing asked to be retried; otherwise the smallest suggested delay, or a
    /// random delay in `[min, max)` when no signal suggested one.
    pub fn next_delay(&self, signals: &[RetryableError]) -> Option<Duration> {
        if signals.is_empty() {
            return None;
        }
        if let Some(d) = signals.iter().filter_map(|r| r.delay).min() {
            return Some(d);
        }
        Some(self.random_delay())
    }

    pub fn random_delay(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let ms = rand::thread_rng().gen_range(self.min.as_millis() as u64..self.max.as_millis() as u64);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_signals_no_requeue() {
        assert_eq!(RequeuePolicy::default().next_delay(&[]), None);
    }

    #[test]
    fn smallest_suggested_delay_wins() {
        let signals = vec![
            RetryableError::new("a").with_delay(Duration::from_secs(10)),
            RetryableError::new("b"),
            RetryableError::new("c").with_delay(Duration::from_secs(2)),
        ];
        assert_eq!(RequeuePolicy::default().next_delay(&signals), Some(Duration::from_secs(2)));
    }

    #[test]
    fn random_delay_stays_in_window() {
        let p = RequeuePolicy::default();
        for _ in 0..50 {
            let d = p.next_delay(&[RetryableError::new("a")]).unwrap();
            assert!(d >= Duration::from_secs(3) && d < Duration::from_secs(5), "{d:?}");
        }
        let fixed = RequeuePolicy { min: Duration::from_secs(1), max: Duration::from_secs(1) };
        assert_eq!(fixed.random_delay(), Duration::from_secs(1));
    }
}
