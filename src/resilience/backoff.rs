//! Reconnect delays with jitter.

use std::time::Duration;

use rand::Rng;

/// Fraction of the base delay added at most as jitter.
const JITTER_RATIO: u32 = 10;

/// Delay before the next connection attempt: `interval` plus up to 10%
/// positive jitter.
pub fn reconnect_delay(interval: Duration) -> Duration {
    let jitter_range = interval / JITTER_RATIO;
    if jitter_range.is_zero() {
        return interval;
    }

    let jitter = rand::thread_rng().gen_range(Duration::ZERO..=jitter_range);
    interval + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_jitter_window() {
        let interval = Duration::from_secs(30);
        for _ in 0..100 {
            let delay = reconnect_delay(interval);
            assert!(delay >= interval);
            assert!(delay <= interval + Duration::from_secs(3));
        }
    }

    #[test]
    fn tiny_intervals_have_no_jitter() {
        assert_eq!(reconnect_delay(Duration::from_nanos(5)), Duration::from_nanos(5));
    }
}
