use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

/// Per-key token-bucket admission control.
///
/// Guarantees:
/// - Memory usage is bounded by `max_keys`.
/// - On overflow, evicts a "cold" key from a bounded sample: the one whose
///   bucket was refilled longest ago (refill time is last-use time).
///
/// Time is passed in by the caller so behaviour is testable without
/// sleeping; `admit` is the wall-clock convenience wrapper.
pub struct RateLimiter {
    /// Burst size; a fresh key starts with a full bucket.
    capacity: f64,
    /// Tokens restored per second of elapsed time.
    refill_rate: f64,
    /// Soft cap on tracked keys.
    max_keys: usize,
    /// Number of entries sampled when selecting an eviction victim.
    eviction_scan: usize,

    buckets: Mutex<HashMap<String, Bucket>>,
}

#[derive(Clone, Copy, Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(capacity: f64, refill_rate: f64, max_keys: usize) -> Self {
        Self {
            capacity: capacity.max(1.0),
            refill_rate: refill_rate.max(0.0),
            max_keys: max_keys.max(1),
            eviction_scan: 64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(&self, key: &str) -> bool {
        self.admit_at(key, Instant::now())
    }

    /// Refills the key's bucket up to `now`, then takes one token if any
    /// whole token is available.
    pub fn admit_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();

        if !buckets.contains_key(key) && buckets.len() >= self.max_keys {
            evict_coldest(&mut buckets, self.eviction_scan);
        }

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Number of client keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().len()
    }
}

/// Removes the stalest entry among a bounded sample of the map.
fn evict_coldest(buckets: &mut HashMap<String, Bucket>, scan: usize) {
    let victim = buckets
        .iter()
        .take(scan.max(1))
        .min_by_key(|(_, b)| b.last_refill)
        .map(|(k, _)| k.clone());

    if let Some(key) = victim {
        debug!(key = %key, "rate limiter key cap reached; evicting coldest");
        buckets.remove(&key);
    }
}
