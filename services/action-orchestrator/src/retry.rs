use std::time::Duration;

use rand::Rng;

use crate::bundle::RetryPolicy;

/// Delay before attempt `n + 1`: `initial * multiplier^(n-1)` for attempt n,
/// plus up to 10% jitter so synchronized failures don't retry in lockstep.
pub fn backoff_delay(policy: &RetryPolicy, completed_attempts: u32) -> Duration {
    let exponent = completed_attempts.saturating_sub(1);
    let base_ms = policy.initial_backoff_ms as f64 * policy.multiplier.max(1.0).powi(exponent as i32);
    // Cap the exponential curve well below overflow territory.
    let base_ms = base_ms.min(30.0 * 60.0 * 1000.0);
    let jitter = rand::thread_rng().gen_range(0.0..=0.10);
    Duration::from_millis((base_ms * (1.0 + jitter)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial: u64, multiplier: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: initial,
            multiplier,
        }
    }

    #[test]
    fn delays_grow_geometrically_with_bounded_jitter() {
        let policy = policy(100, 2.0);
        for (attempt, base) in [(1u32, 100u64), (2, 200), (3, 400), (4, 800)] {
            let delay = backoff_delay(&policy, attempt).as_millis() as u64;
            assert!(
                delay >= base && delay <= base + base / 10 + 1,
                "attempt {attempt}: delay {delay}ms outside [{base}, {}]",
                base + base / 10
            );
        }
    }

    #[test]
    fn sub_one_multipliers_do_not_shrink_the_delay() {
        let policy = policy(1_000, 0.5);
        let delay = backoff_delay(&policy, 3).as_millis() as u64;
        assert!(delay >= 1_000);
    }

    #[test]
    fn runaway_exponents_are_capped() {
        let policy = policy(60_000, 10.0);
        let delay = backoff_delay(&policy, 20);
        assert!(delay <= Duration::from_millis(33 * 60 * 1000));
    }
}
