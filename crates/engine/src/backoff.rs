//! Exponential backoff with jitter for stage retries.

use rand::Rng;
use std::time::Duration;

/// Delay before retry `attempt` (1-based): base * 2^(attempt-1), jittered
/// by ±25%.
pub(crate) fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16));
    jitter(exp)
}

pub(crate) fn jitter(d: Duration) -> Duration {
    if d.is_zero() {
        return d;
    }
    let spread = d.as_millis() as f64 * 0.25;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    let millis = (d.as_millis() as f64 + offset).max(0.0);
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially() {
        let base = Duration::from_secs(1);
        for attempt in 1..=3u32 {
            let d = retry_delay(base, attempt);
            let nominal = Duration::from_secs(1 << (attempt - 1));
            assert!(d >= nominal.mul_f64(0.74), "attempt {attempt}: {d:?}");
            assert!(d <= nominal.mul_f64(1.26), "attempt {attempt}: {d:?}");
        }
    }
}
