use rand::Rng;
use std::time::Duration;

/// Picks a poll interval in `[3/4 * base, base]` so that waiters on the same
/// lock document do not all retry in lockstep.
pub fn random_poll_interval(base: Duration) -> Duration {
    let max_ms = base.as_millis().max(1) as u64;
    let min_ms = (max_ms * 3 / 4).max(1);
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min_ms..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_bounds() {
        let base = Duration::from_millis(400);
        for _ in 0..100 {
            let d = random_poll_interval(base);
            assert!(d >= Duration::from_millis(300) && d <= base);
        }
    }

    #[test]
    fn zero_base_is_clamped() {
        assert_eq!(random_poll_interval(Duration::ZERO), Duration::from_millis(1));
    }
}
