//! Retry backoff policies.
//!
//! Delay growth uses a fixed-point multiplier (`multiplier /
//! multiplier_base`) so two nodes computing the same schedule never
//! disagree over float rounding.

use std::time::Duration;

pub trait Backoff {
    fn base_delay_ms(&self) -> u64;

    fn next_delay_ms(&self, curr_delay_ms: u64) -> u64;

    /// Delay to sleep before retry number `attempt` (1-based).
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.base_delay_ms();
        for _ in 1..attempt {
            delay = self.next_delay_ms(delay);
        }
        Duration::from_millis(delay)
    }
}

/// Exponential backoff with a hard cap on the delay.
pub struct ExponentialBackoff {
    base_delay_ms: u64,
    multiplier: u64,
    multiplier_base: u64,
    cap_ms: u64,
}

impl ExponentialBackoff {
    pub fn new(base_delay_ms: u64, multiplier: u64, multiplier_base: u64, cap_ms: u64) -> Self {
        assert!(multiplier_base != 0);
        Self {
            base_delay_ms,
            multiplier,
            multiplier_base,
            cap_ms,
        }
    }

    /// The upstream RPC schedule: 1 s growing 1.5x, capped at 15 s.
    pub fn upstream() -> Self {
        Self::new(1_000, 15, 10, 15_000)
    }

    /// The block-fetch schedule: 1 s growing 2x, capped at 30 s.
    pub fn block_fetch() -> Self {
        Self::new(1_000, 2, 1, 30_000)
    }
}

impl Backoff for ExponentialBackoff {
    fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    fn next_delay_ms(&self, curr_delay_ms: u64) -> u64 {
        u64::min(
            curr_delay_ms * self.multiplier / self.multiplier_base,
            self.cap_ms,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_schedule() {
        let b = ExponentialBackoff::upstream();
        assert_eq!(b.delay_for_attempt(1), Duration::from_millis(1_000));
        assert_eq!(b.delay_for_attempt(2), Duration::from_millis(1_500));
        assert_eq!(b.delay_for_attempt(3), Duration::from_millis(2_250));
        // Far-out attempts hit the cap.
        assert_eq!(b.delay_for_attempt(30), Duration::from_millis(15_000));
    }

    #[test]
    fn test_block_fetch_cap() {
        let b = ExponentialBackoff::block_fetch();
        assert_eq!(b.delay_for_attempt(5), Duration::from_millis(16_000));
        assert_eq!(b.delay_for_attempt(6), Duration::from_millis(30_000));
        assert_eq!(b.delay_for_attempt(7), Duration::from_millis(30_000));
    }
}
