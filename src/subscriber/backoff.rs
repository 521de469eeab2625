use std::time::Duration;

use rand::Rng;

use crate::config::SubscriberConfig;

/// Reconnect delay schedule: `base * 2^(attempt-1)`, capped, plus jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    jitter: f64,
}

impl Backoff {
    /// Schedule from subscriber settings.
    #[must_use]
    pub fn from_config(cfg: &SubscriberConfig) -> Self {
        Self {
            base_ms: cfg.backoff_base_ms.max(1),
            max_ms: cfg.max_backoff_ms.max(cfg.backoff_base_ms.max(1)),
            jitter: cfg.jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self.base_ms.saturating_mul(1_u64 << shift).min(self.max_ms);
        Duration::from_millis(ms)
    }

    /// Delay before retry number `attempt` with uniform jitter in `[0, jitter * delay]`.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let extra = base.as_secs_f64() * self.jitter * rng.gen_range(0.0..=1.0);
        base + Duration::from_secs_f64(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn backoff(base: u64, max: u64, jitter: f64) -> Backoff {
        Backoff::from_config(&SubscriberConfig {
            backoff_base_ms: base,
            max_backoff_ms: max,
            jitter,
            ..SubscriberConfig::default()
        })
    }

    #[test]
    fn doubles_then_caps() {
        let b = backoff(100, 1_000, 0.0);
        let delays: Vec<u64> = (1..=6).map(|a| b.base_delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(b.base_delay(200), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let b = backoff(100, 10_000, 0.5);
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=5 {
            let base = b.base_delay(attempt);
            let d = b.delay(attempt, &mut rng);
            assert!(d >= base);
            assert!(d <= base + base / 2 + Duration::from_millis(1));
        }
    }
}
