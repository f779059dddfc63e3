//! Bounded, jittered exponential backoff.
//!
//! `delay(attempt) = min(max, base × 2^(attempt - 1))`, optionally
//! jittered so that many instances failing at once do not retry in
//! lockstep.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Jitter strategy applied on top of the exponential delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Deterministic delay.
    #[default]
    None,
    /// Uniform in `[0, d]`.
    Full,
    /// `d / 2` plus uniform in `[0, d / 2]`.
    Equal,
}

/// Retry delay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
    pub jitter: Jitter,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, max_attempts: u32, jitter: Jitter) -> Self {
        Self {
            base,
            max,
            max_attempts: max_attempts.max(1),
            jitter,
        }
    }

    /// Un-jittered delay for `attempt` (1-based, clamped to
    /// `[1, max_attempts]`).
    pub fn deterministic_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.clamp(1, self.max_attempts);
        let exponent = (attempt - 1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Delay for `attempt` with this policy's jitter applied.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.deterministic_delay(attempt);
        match self.jitter {
            Jitter::None => delay,
            Jitter::Full => random_up_to(rng, delay),
            Jitter::Equal => {
                let half = delay / 2;
                half + random_up_to(rng, delay - half)
            }
        }
    }
}

/// One-shot form of [`BackoffPolicy::delay`].
pub fn calculate_backoff<R: Rng + ?Sized>(
    attempt: u32,
    max_attempts: u32,
    base: Duration,
    max: Duration,
    jitter: Jitter,
    rng: &mut R,
) -> Duration {
    BackoffPolicy::new(base, max, max_attempts, jitter).delay(attempt, rng)
}

fn random_up_to<R: Rng + ?Sized>(rng: &mut R, upper: Duration) -> Duration {
    let nanos = u64::try_from(upper.as_nanos()).unwrap_or(u64::MAX);
    Duration::from_nanos(rng.random_range(0..=nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn image_policy(jitter: Jitter) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(300),
            Duration::from_secs(15),
            10,
            jitter,
        )
    }

    #[test]
    fn deterministic_delays_are_monotonic_and_capped() {
        let policy = image_policy(Jitter::None);
        let delays: Vec<Duration> = (1..=10).map(|a| policy.deterministic_delay(a)).collect();

        assert_eq!(delays[0], Duration::from_millis(300));
        assert_eq!(delays[1], Duration::from_millis(600));
        assert_eq!(delays[5], Duration::from_millis(9600));
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "{:?} > {:?}", pair[0], pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(15)));
        assert_eq!(delays[9], Duration::from_secs(15));
    }

    #[test]
    fn attempts_are_clamped() {
        let policy = image_policy(Jitter::None);
        assert_eq!(policy.deterministic_delay(0), Duration::from_millis(300));
        assert_eq!(policy.deterministic_delay(500), Duration::from_secs(15));
    }

    #[test]
    fn no_jitter_matches_deterministic() {
        let policy = image_policy(Jitter::None);
        let mut rng = StdRng::seed_from_u64(1);
        for attempt in 1..=10 {
            assert_eq!(policy.delay(attempt, &mut rng), policy.deterministic_delay(attempt));
        }
    }

    #[test]
    fn equal_jitter_stays_in_upper_half() {
        let policy = image_policy(Jitter::Equal);
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 1..=10 {
            let full = policy.deterministic_delay(attempt);
            for _ in 0..50 {
                let d = policy.delay(attempt, &mut rng);
                assert!(d >= full / 2, "{d:?} below half of {full:?}");
                assert!(d <= full, "{d:?} above {full:?}");
            }
        }
    }

    #[test]
    fn full_jitter_never_exceeds_delay() {
        let policy = image_policy(Jitter::Full);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            assert!(policy.delay(4, &mut rng) <= Duration::from_millis(2400));
        }
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        let policy = image_policy(Jitter::Equal);
        let a = policy.delay(3, &mut StdRng::seed_from_u64(9));
        let b = policy.delay(3, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn one_shot_helper() {
        let mut rng = StdRng::seed_from_u64(0);
        let d = calculate_backoff(
            2,
            10,
            Duration::from_millis(100),
            Duration::from_secs(1),
            Jitter::None,
            &mut rng,
        );
        assert_eq!(d, Duration::from_millis(200));
    }
}
