// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-handle operation counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// The operations a handle counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StatsCounter {
    /// A get that found an item.
    Hit,
    /// A get that found nothing.
    Miss,
    /// A get call.
    Get,
    /// An add call.
    Add,
    /// A put call.
    Put,
    /// An update call.
    Update,
    /// A remove call.
    Remove,
    /// A clear call.
    Clear,
    /// A clear-region call.
    ClearRegion,
}

/// Lock-free counters describing the traffic a handle has seen.
///
/// Recording is a no-op unless the statistics were created enabled.
///
/// # Examples
///
/// ```
/// use tierlink_handle::{HandleStats, StatsCounter};
///
/// let stats = HandleStats::new(true);
/// stats.record(StatsCounter::Hit);
/// stats.record(StatsCounter::Miss);
///
/// let snapshot = stats.snapshot();
/// assert_eq!(snapshot.hits, 1);
/// assert_eq!(snapshot.misses, 1);
/// ```
#[derive(Debug, Default)]
pub struct HandleStats {
    enabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    gets: AtomicU64,
    adds: AtomicU64,
    puts: AtomicU64,
    updates: AtomicU64,
    removes: AtomicU64,
    clears: AtomicU64,
    clear_regions: AtomicU64,
}

/// A point-in-time copy of [`HandleStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Gets that found an item.
    pub hits: u64,
    /// Gets that found nothing.
    pub misses: u64,
    /// Get calls.
    pub gets: u64,
    /// Add calls.
    pub adds: u64,
    /// Put calls.
    pub puts: u64,
    /// Update calls.
    pub updates: u64,
    /// Remove calls.
    pub removes: u64,
    /// Clear calls.
    pub clears: u64,
    /// Clear-region calls.
    pub clear_regions: u64,
}

impl HandleStats {
    /// Creates counters that record only when `enabled` is set.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            ..Self::default()
        }
    }

    /// Returns `true` if counters are recorded.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Increments `counter` by one.
    pub fn record(&self, counter: StatsCounter) {
        if !self.is_enabled() {
            return;
        }

        self.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current value of `counter`.
    #[must_use]
    pub fn get(&self, counter: StatsCounter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    /// Copies every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.get(StatsCounter::Hit),
            misses: self.get(StatsCounter::Miss),
            gets: self.get(StatsCounter::Get),
            adds: self.get(StatsCounter::Add),
            puts: self.get(StatsCounter::Put),
            updates: self.get(StatsCounter::Update),
            removes: self.get(StatsCounter::Remove),
            clears: self.get(StatsCounter::Clear),
            clear_regions: self.get(StatsCounter::ClearRegion),
        }
    }

    fn slot(&self, counter: StatsCounter) -> &AtomicU64 {
        match counter {
            StatsCounter::Hit => &self.hits,
            StatsCounter::Miss => &self.misses,
            StatsCounter::Get => &self.gets,
            StatsCounter::Add => &self.adds,
            StatsCounter::Put => &self.puts,
            StatsCounter::Update => &self.updates,
            StatsCounter::Remove => &self.removes,
            StatsCounter::Clear => &self.clears,
            StatsCounter::ClearRegion => &self.clear_regions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_stats_record_nothing() {
        let stats = HandleStats::new(false);
        stats.record(StatsCounter::Put);
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn enabled_stats_count_each_call() {
        let stats = HandleStats::new(true);
        stats.record(StatsCounter::Put);
        stats.record(StatsCounter::Put);
        stats.record(StatsCounter::ClearRegion);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.puts, 2);
        assert_eq!(snapshot.clear_regions, 1);
        assert_eq!(snapshot.hits, 0);
    }
}
