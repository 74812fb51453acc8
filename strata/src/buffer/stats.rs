//! Buffer pool counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter on its own cache line so hot counters do not false-share
#[repr(align(64))]
struct AlignedCounter(AtomicU64);

impl AlignedCounter {
    fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn load(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    fn fetch_max(&self, val: u64) {
        self.0.fetch_max(val, Ordering::Relaxed);
    }
}

pub struct BufferStats {
    pins: AlignedCounter,
    loads: AlignedCounter,
    unloads: AlignedCounter,
    evictions: AlignedCounter,
    exhausted: AlignedCounter,
    peak_resident: AlignedCounter,
}

/// Point-in-time copy of `BufferStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStatsSnapshot {
    pub pins: u64,
    pub loads: u64,
    pub unloads: u64,
    pub evictions: u64,
    pub exhausted: u64,
    pub peak_resident: u64,
}

impl Default for BufferStats {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferStats {
    pub fn new() -> Self {
        Self {
            pins: AlignedCounter::new(),
            loads: AlignedCounter::new(),
            unloads: AlignedCounter::new(),
            evictions: AlignedCounter::new(),
            exhausted: AlignedCounter::new(),
            peak_resident: AlignedCounter::new(),
        }
    }

    pub(crate) fn record_pin(&self) {
        self.pins.incr();
    }

    pub(crate) fn record_load(&self) {
        self.loads.incr();
    }

    pub(crate) fn record_unload(&self, evicted: bool) {
        self.unloads.incr();
        if evicted {
            self.evictions.incr();
        }
    }

    pub(crate) fn record_exhausted(&self) {
        self.exhausted.incr();
    }

    pub(crate) fn record_resident(&self, bytes: u64) {
        self.peak_resident.fetch_max(bytes);
    }

    pub fn snapshot(&self) -> BufferStatsSnapshot {
        BufferStatsSnapshot {
            pins: self.pins.load(),
            loads: self.loads.load(),
            unloads: self.unloads.load(),
            evictions: self.evictions.load(),
            exhausted: self.exhausted.load(),
            peak_resident: self.peak_resident.load(),
        }
    }
}
