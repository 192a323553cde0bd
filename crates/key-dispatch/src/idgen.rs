//! Monotonic backend-id allocator.
//!
//! Ids are process-global and never reused, so per-backend state keyed by id
//! is never accidentally inherited when an address is recycled.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

pub struct IdGen {
    last: AtomicU64,
}

impl IdGen {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Next id, starting at 1.
    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Relaxed) + 1
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}
