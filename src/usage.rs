//! Usage accounting: monotonically accumulating token counters.
//!
//! Counters are plain atomics -- increments happen on the hot path between a
//! backend response and delivery of the framed reply, and must never block.
//! The per-depth breakdown keeps one atomic cell per depth behind a mutex
//! that is only taken to look up or insert the cell, not to increment it.

use crate::protocol::Usage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Accumulated usage across some scope (a client, a session, a depth).
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct UsageSummary {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl UsageSummary {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    cache_read: AtomicU64,
    cache_write: AtomicU64,
}

impl Counters {
    fn record(&self, usage: &Usage) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.input_tokens.fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.output_tokens.fetch_add(usage.output_tokens, Ordering::Relaxed);
        self.cache_read
            .fetch_add(usage.cache_read.unwrap_or(0), Ordering::Relaxed);
        self.cache_write
            .fetch_add(usage.cache_write.unwrap_or(0), Ordering::Relaxed);
    }

    fn snapshot(&self) -> UsageSummary {
        UsageSummary {
            calls: self.calls.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            cache_read: self.cache_read.load(Ordering::Relaxed),
            cache_write: self.cache_write.load(Ordering::Relaxed),
        }
    }
}

/// Concurrency-safe usage tracker with a total and a per-depth breakdown.
///
/// Cheap to clone; clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct UsageTracker {
    totals: Arc<Counters>,
    per_depth: Arc<Mutex<BTreeMap<u32, Arc<Counters>>>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call's usage under the given depth.
    pub fn record(&self, depth: u32, usage: &Usage) {
        self.totals.record(usage);
        let cell = {
            let mut map = self.per_depth.lock().expect("usage map poisoned");
            Arc::clone(map.entry(depth).or_default())
        };
        cell.record(usage);
    }

    /// Snapshot of the accumulated totals.
    pub fn summary(&self) -> UsageSummary {
        self.totals.snapshot()
    }

    /// Snapshot of accumulated usage keyed by depth, ascending.
    pub fn by_depth(&self) -> BTreeMap<u32, UsageSummary> {
        let map = self.per_depth.lock().expect("usage map poisoned");
        map.iter().map(|(d, c)| (*d, c.snapshot())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            cache_read: None,
            cache_write: None,
        }
    }

    #[test]
    fn test_totals_accumulate() {
        let tracker = UsageTracker::new();
        tracker.record(0, &usage(100, 20));
        tracker.record(1, &usage(50, 10));

        let summary = tracker.summary();
        assert_eq!(summary.calls, 2);
        assert_eq!(summary.input_tokens, 150);
        assert_eq!(summary.output_tokens, 30);
        assert_eq!(summary.total_tokens(), 180);
    }

    #[test]
    fn test_per_depth_breakdown() {
        let tracker = UsageTracker::new();
        tracker.record(0, &usage(10, 1));
        tracker.record(1, &usage(20, 2));
        tracker.record(1, &usage(30, 3));

        let by_depth = tracker.by_depth();
        assert_eq!(by_depth[&0].calls, 1);
        assert_eq!(by_depth[&1].calls, 2);
        assert_eq!(by_depth[&1].input_tokens, 50);
    }

    #[test]
    fn test_cache_counters() {
        let tracker = UsageTracker::new();
        tracker.record(
            0,
            &Usage {
                input_tokens: 5,
                output_tokens: 5,
                cache_read: Some(1000),
                cache_write: Some(200),
            },
        );
        let summary = tracker.summary();
        assert_eq!(summary.cache_read, 1000);
        assert_eq!(summary.cache_write, 200);
    }

    #[test]
    fn test_clones_share_counters() {
        let tracker = UsageTracker::new();
        let clone = tracker.clone();
        clone.record(0, &usage(7, 3));
        assert_eq!(tracker.summary().total_tokens(), 10);
    }

    #[test]
    fn test_concurrent_increments() {
        let tracker = UsageTracker::new();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let t = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        t.record(1, &usage(1, 1));
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }
        assert_eq!(tracker.summary().calls, 800);
        assert_eq!(tracker.by_depth()[&1].input_tokens, 800);
    }
}
