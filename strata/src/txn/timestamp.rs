//! Monotonic timestamp source

use std::sync::atomic::{AtomicU64, Ordering};

/// Logical timestamp. `0` is never allocated.
pub type Timestamp = u64;

/// Monotonically increasing timestamp allocator
///
/// Passed to whoever needs timestamps instead of living in a global, so tests
/// can start from a known value.
#[derive(Debug)]
pub struct TimestampAllocator {
    next: AtomicU64,
}

impl TimestampAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Allocator whose first `next()` returns `ts`
    pub fn starting_at(ts: Timestamp) -> Self {
        Self {
            next: AtomicU64::new(ts.max(1)),
        }
    }

    /// Allocate the next timestamp
    #[inline]
    pub fn next(&self) -> Timestamp {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

}

impl Default for TimestampAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_monotonic() {
        let alloc = TimestampAllocator::starting_at(10);
        assert_eq!(alloc.next(), 10);
        assert_eq!(alloc.next(), 11);
        assert_eq!(alloc.next(), 12);
    }

    #[test]
    fn test_concurrent_unique() {
        let alloc = Arc::new(TimestampAllocator::new());
        let mut all: Vec<Timestamp> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let alloc = alloc.clone();
                    s.spawn(move || (0..1000).map(|_| alloc.next()).collect::<Vec<_>>())
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }
}
