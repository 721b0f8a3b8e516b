//! Per-owner token bucket for the scheduling API.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Refills `permits_per_second` tokens per second up to a burst of
/// `max(permits_per_second, 1)`.
pub struct OwnerThrottle {
    permits_per_second: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl OwnerThrottle {
    pub fn new(permits_per_second: f64) -> Self {
        Self {
            permits_per_second,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, owner: &str) -> bool {
        self.try_acquire_at(owner, Instant::now())
    }

    pub fn try_acquire_at(&self, owner: &str, now: Instant) -> bool {
        let capacity = self.permits_per_second.max(1.0);
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        let bucket = buckets.entry(owner.to_string()).or_insert(Bucket {
            tokens: capacity,
            last: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.permits_per_second).min(capacity);
        bucket.last = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return true;
        }

        metrics::counter!("schedule_update_throttled_total").increment(1);
        tracing::debug!(owner = %owner, "Schedule request throttled");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_second_request_within_a_second_is_throttled() {
        let throttle = OwnerThrottle::new(1.0);
        let start = Instant::now();

        assert!(throttle.try_acquire_at("com.owner", start));
        assert!(!throttle.try_acquire_at("com.owner", start + Duration::from_millis(200)));
        assert!(throttle.try_acquire_at("com.owner", start + Duration::from_millis(1_300)));
    }

    #[test]
    fn test_owners_have_separate_buckets() {
        let throttle = OwnerThrottle::new(1.0);
        let now = Instant::now();

        assert!(throttle.try_acquire_at("com.a", now));
        assert!(throttle.try_acquire_at("com.b", now));
        assert!(!throttle.try_acquire_at("com.a", now));
    }

    #[test]
    fn test_burst_matches_rate() {
        let throttle = OwnerThrottle::new(3.0);
        let now = Instant::now();

        assert!((0..3).all(|_| throttle.try_acquire_at("com.owner", now)));
        assert!(!throttle.try_acquire_at("com.owner", now));
    }
}
