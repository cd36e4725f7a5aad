use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(15 * 60),
            jitter_pct: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

/// Delay before the attempt that follows failed attempt `attempt_no`
/// (1-based): `base * 2^(attempt_no - 1)`, capped, then jittered.
pub fn next_delay(attempt_no: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> Duration {
    let exp = (attempt_no.max(1) as u32).saturating_sub(1);

    // 2^exp; anything past u32 range saturates and the cap takes over.
    let pow2 = 1_u32.checked_shl(exp).unwrap_or(u32::MAX);
    let delay = cfg.base_delay.saturating_mul(pow2).min(cfg.max_delay);

    if cfg.jitter_pct <= 0.0 {
        return delay;
    }

    let secs = delay.as_secs_f64();
    let range = secs * cfg.jitter_pct;
    let jittered = secs + rng.gen_range(-range..=range);
    Duration::from_secs_f64(jittered.clamp(0.0, cfg.max_delay.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn doubles_from_base_and_caps() {
        let cfg = RetryConfig::default();
        let mut rng = StdRng::seed_from_u64(7);

        let delays: Vec<u64> = (1..=12)
            .map(|n| next_delay(n, &cfg, &mut rng).as_secs())
            .collect();

        assert_eq!(&delays[..5], &[2, 4, 8, 16, 32]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), 15 * 60);
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let cfg = RetryConfig::default();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(next_delay(i32::MAX, &cfg, &mut rng), cfg.max_delay);
        assert_eq!(next_delay(0, &cfg, &mut rng), cfg.base_delay);
    }

    #[test]
    fn jitter_stays_within_band() {
        let cfg = RetryConfig {
            jitter_pct: 0.2,
            ..RetryConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..100 {
            let d = next_delay(3, &cfg, &mut rng).as_secs_f64();
            assert!((6.39..=9.61).contains(&d), "delay {d} outside jitter band");
        }
    }
}
