use rand::Rng;
use std::time::Duration;

/// Idle poll delay with random jitter so workers started together drift apart.
pub fn jittered_poll_interval(base_ms: u64, jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::from_millis(base_ms);
    }
    let mut rng = rand::thread_rng();
    let offset = rng.gen_range(0..=jitter_ms);
    Duration::from_millis(base_ms.saturating_add(offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..100 {
            let d = jittered_poll_interval(100, 50);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
        assert_eq!(jittered_poll_interval(100, 0), Duration::from_millis(100));
    }
}
