use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Minimal counters for operational visibility.
#[derive(Clone, Default)]
pub struct Counters {
    pub alloc_granted: Arc<AtomicU64>,
    pub alloc_idempotent: Arc<AtomicU64>,
    pub alloc_overloaded: Arc<AtomicU64>,
    pub alloc_invalid: Arc<AtomicU64>,
    pub alloc_retries: Arc<AtomicU64>,

    pub free_released: Arc<AtomicU64>,
    pub free_not_found: Arc<AtomicU64>,

    pub rate_limited: Arc<AtomicU64>,
}

/// Point-in-time copy of the counters, as reported by the metrics endpoint.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub alloc_granted: u64,
    pub alloc_idempotent: u64,
    pub alloc_overloaded: u64,
    pub alloc_invalid: u64,
    pub alloc_retries: u64,
    pub free_released: u64,
    pub free_not_found: u64,
    pub rate_limited: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            alloc_granted: self.alloc_granted.load(Ordering::Relaxed),
            alloc_idempotent: self.alloc_idempotent.load(Ordering::Relaxed),
            alloc_overloaded: self.alloc_overloaded.load(Ordering::Relaxed),
            alloc_invalid: self.alloc_invalid.load(Ordering::Relaxed),
            alloc_retries: self.alloc_retries.load(Ordering::Relaxed),
            free_released: self.free_released.load(Ordering::Relaxed),
            free_not_found: self.free_not_found.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
