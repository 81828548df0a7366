//! Device memory accounting shared with the external render scheduler.
//!
//! Uses atomic counters so any thread can observe usage without locks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Running totals of device memory allocated through the driver.
#[derive(Debug, Default)]
pub struct MemoryStats {
    allocated: AtomicU64,
    peak: AtomicU64,
}

impl MemoryStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Account `bytes` of freshly allocated device memory.
    pub fn mem_alloc(&self, bytes: u64) {
        let now = self.allocated.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    /// Account `bytes` of released device memory.
    pub fn mem_free(&self, bytes: u64) {
        self.allocated.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip() {
        let stats = MemoryStats::new();
        stats.mem_alloc(1024);
        stats.mem_alloc(512);
        assert_eq!(stats.allocated(), 1536);
        assert_eq!(stats.peak(), 1536);

        stats.mem_free(1024);
        assert_eq!(stats.allocated(), 512);
        assert_eq!(stats.peak(), 1536);
    }
}
