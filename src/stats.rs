//! Per-worker event counters and their post-run aggregation.
//!
//! Counters are plain `u64` fields bumped by the owning worker only; there
//! are no atomics on the hot path. Each worker's counters are merged into a
//! snapshot after its thread joins, so a snapshot is always a consistent
//! end-of-run view. Scheduling correctness never depends on any of these
//! values.

use std::fmt;

/// Event counters for one worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "stats-serde", derive(serde::Serialize))]
pub struct WorkerStats {
    /// Tasks published to a chain node.
    pub put: u64,
    /// Tasks taken from the worker's own chain.
    pub take: u64,
    /// Empty takes.
    pub take_failed: u64,
    /// Targeted steals from the mirrored victim node during local work.
    pub single_steal: u64,
    /// Targeted steals that found nothing or lost the race.
    pub single_steal_failed: u64,
    /// Steals made while walking the victim chain in the steal loop.
    pub multiple_steal: u64,
    /// Chain-walk attempts that found nothing or lost the race.
    pub multiple_steal_failed: u64,
    /// Deque buffer growths across the worker's chain.
    pub resize: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &WorkerStats) {
        self.put += other.put;
        self.take += other.take;
        self.take_failed += other.take_failed;
        self.single_steal += other.single_steal;
        self.single_steal_failed += other.single_steal_failed;
        self.multiple_steal += other.multiple_steal;
        self.multiple_steal_failed += other.multiple_steal_failed;
        self.resize += other.resize;
    }

    /// Tasks this worker executed, however it obtained them.
    pub fn executed(&self) -> u64 {
        self.take + self.single_steal + self.multiple_steal
    }
}

/// End-of-run statistics: one entry per worker plus totals.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "stats-serde", derive(serde::Serialize))]
pub struct StatsSnapshot {
    pub workers: Vec<WorkerStats>,
    pub total: WorkerStats,
}

impl StatsSnapshot {
    pub fn new(workers: Vec<WorkerStats>) -> Self {
        let mut total = WorkerStats::default();
        for w in &workers {
            total.merge(w);
        }
        Self { workers, total }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>6} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8}",
            "worker", "put", "take", "take!", "steal", "steal!", "msteal", "msteal!", "resize"
        )?;
        let row = |f: &mut fmt::Formatter<'_>, label: &str, s: &WorkerStats| {
            writeln!(
                f,
                "{:>6} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8}",
                label,
                s.put,
                s.take,
                s.take_failed,
                s.single_steal,
                s.single_steal_failed,
                s.multiple_steal,
                s.multiple_steal_failed,
                s.resize
            )
        };
        for (id, s) in self.workers.iter().enumerate() {
            row(f, &id.to_string(), s)?;
        }
        row(f, "total", &self.total)
    }
}
