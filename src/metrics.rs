//! Counters for the spill pipeline.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of the spill counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpillMetricsSnapshot {
    pub spill_episodes: u64,
    pub bytes_spilled: u64,
    pub bytes_read_back: u64,
    pub create_retries: u64,
    pub short_write_resumes: u64,
    pub errors_latched: u64,
}

/// Atomic counters shared between a channel and its observers.
#[derive(Debug, Default)]
pub struct SpillMetrics {
    spill_episodes: AtomicU64,
    bytes_spilled: AtomicU64,
    bytes_read_back: AtomicU64,
    create_retries: AtomicU64,
    short_write_resumes: AtomicU64,
    errors_latched: AtomicU64,
}

impl SpillMetrics {
    #[inline]
    pub fn incr_spill_episodes(&self) {
        self.spill_episodes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_spilled(&self, bytes: u64) {
        self.bytes_spilled.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_read_back(&self, bytes: u64) {
        self.bytes_read_back.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_create_retries(&self) {
        self.create_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_short_write_resumes(&self) {
        self.short_write_resumes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_errors_latched(&self) {
        self.errors_latched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SpillMetricsSnapshot {
        SpillMetricsSnapshot {
            spill_episodes: self.spill_episodes.load(Ordering::Relaxed),
            bytes_spilled: self.bytes_spilled.load(Ordering::Relaxed),
            bytes_read_back: self.bytes_read_back.load(Ordering::Relaxed),
            create_retries: self.create_retries.load(Ordering::Relaxed),
            short_write_resumes: self.short_write_resumes.load(Ordering::Relaxed),
            errors_latched: self.errors_latched.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = SpillMetrics::default();
        metrics.incr_spill_episodes();
        metrics.add_bytes_spilled(100);
        metrics.add_bytes_read_back(40);
        metrics.incr_create_retries();
        metrics.incr_short_write_resumes();
        metrics.incr_errors_latched();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.spill_episodes, 1);
        assert_eq!(snapshot.bytes_spilled, 100);
        assert_eq!(snapshot.bytes_read_back, 40);
        assert_eq!(snapshot.create_retries, 1);
        assert_eq!(snapshot.short_write_resumes, 1);
        assert_eq!(snapshot.errors_latched, 1);
    }
}
