//! Per-session token bucket for input frames.
//!
//! Starts full so pastes up to the burst capacity pass untouched; refills
//! continuously at the configured rate. Time is passed in explicitly so
//! tests don't sleep.

use std::time::Instant;

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket with the given burst capacity and refill rate.
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec: f64::from(refill_per_sec),
            tokens: f64::from(capacity),
            last_refill: Instant::now(),
        }
    }

    /// Take one token, refilling for elapsed wall-clock time first.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Take one token as of `now`. `now` must not move backwards.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> u32 {
        self.tokens as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_up_to_capacity_then_dry() {
        let mut bucket = TokenBucket::new(3, 1);
        let now = Instant::now();

        assert!(bucket.try_acquire_at(now));
        assert!(bucket.try_acquire_at(now));
        assert!(bucket.try_acquire_at(now));
        assert!(!bucket.try_acquire_at(now));
    }

    #[test]
    fn refills_over_time() {
        let mut bucket = TokenBucket::new(2, 10);
        let start = Instant::now();

        assert!(bucket.try_acquire_at(start));
        assert!(bucket.try_acquire_at(start));
        assert!(!bucket.try_acquire_at(start));

        // 100ms at 10/sec refills one token.
        let later = start + Duration::from_millis(100);
        assert!(bucket.try_acquire_at(later));
        assert!(!bucket.try_acquire_at(later));
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new(2, 100);
        let start = Instant::now();

        // Drain, then wait far longer than needed to refill.
        bucket.try_acquire_at(start);
        bucket.try_acquire_at(start);

        let later = start + Duration::from_secs(60);
        assert!(bucket.try_acquire_at(later));
        assert!(bucket.try_acquire_at(later));
        assert!(!bucket.try_acquire_at(later));
    }

    #[test]
    fn available_reports_whole_tokens() {
        let mut bucket = TokenBucket::new(5, 1);
        assert_eq!(bucket.available(), 5);
        bucket.try_acquire();
        assert_eq!(bucket.available(), 4);
    }
}
