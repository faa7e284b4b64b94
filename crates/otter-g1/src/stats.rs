//! Collection statistics and listeners.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use crate::concurrent::GcPhase;
use crate::task::{GcCollectionType, GcTaskCause};

/// Cycles kept in [`GcStats`].
pub const MAX_CYCLE_RECORDS: usize = 256;

/// Summary of one collection cycle.
#[derive(Debug, Clone)]
pub struct CycleRecord {
    /// What the cycle did
    pub kind: GcCollectionType,
    /// Why it ran
    pub cause: GcTaskCause,
    /// Log tag such as `[YOUNG (Explicit)]`
    pub phase_line: String,
    /// Stop-the-world time
    pub pause: Duration,
    /// Bytes reclaimed
    pub freed_bytes: usize,
    /// Objects reclaimed, when counted
    pub freed_objects: usize,
    /// Bytes copied to other regions
    pub moved_bytes: usize,
    /// Objects copied to other regions
    pub moved_objects: usize,
    /// Young regions promoted in place
    pub promoted_regions: usize,
    /// Regions returned to the pool
    pub freed_regions: usize,
    /// Regions in the collection set
    pub collected_regions: usize,
}

impl CycleRecord {
    /// Empty record for a cycle of `kind`.
    pub fn new(kind: GcCollectionType, cause: GcTaskCause, phase_line: String) -> Self {
        Self {
            kind,
            cause,
            phase_line,
            pause: Duration::ZERO,
            freed_bytes: 0,
            freed_objects: 0,
            moved_bytes: 0,
            moved_objects: 0,
            promoted_regions: 0,
            freed_regions: 0,
            collected_regions: 0,
        }
    }

    /// Add the counters of `other` to this record.
    pub fn merge(&mut self, other: &CycleRecord) {
        self.pause += other.pause;
        self.freed_bytes += other.freed_bytes;
        self.freed_objects += other.freed_objects;
        self.moved_bytes += other.moved_bytes;
        self.moved_objects += other.moved_objects;
        self.promoted_regions += other.promoted_regions;
        self.freed_regions += other.freed_regions;
        self.collected_regions += other.collected_regions;
    }
}

#[derive(Default)]
struct Totals {
    cycles: u64,
    total_pause: Duration,
    max_pause: Duration,
    freed_bytes: usize,
}

/// Recent cycles and running totals.
#[derive(Default)]
pub struct GcStats {
    records: Mutex<VecDeque<CycleRecord>>,
    totals: Mutex<Totals>,
}

impl GcStats {
    /// Empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a finished cycle.
    pub fn record(&self, record: CycleRecord) {
        {
            let mut totals = self.totals.lock();
            totals.cycles += 1;
            totals.total_pause += record.pause;
            totals.max_pause = totals.max_pause.max(record.pause);
            totals.freed_bytes += record.freed_bytes;
        }
        let mut records = self.records.lock();
        if records.len() == MAX_CYCLE_RECORDS {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Recent cycles, oldest first.
    pub fn records(&self) -> Vec<CycleRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Most recent cycle.
    pub fn last(&self) -> Option<CycleRecord> {
        self.records.lock().back().cloned()
    }

    /// Phase lines of recent cycles.
    pub fn phase_lines(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .map(|r| r.phase_line.clone())
            .collect()
    }

    /// Cycles of `kind` among recent ones.
    pub fn count_of(&self, kind: GcCollectionType) -> usize {
        self.records.lock().iter().filter(|r| r.kind == kind).count()
    }

    /// Cycles since start.
    pub fn cycles(&self) -> u64 {
        self.totals.lock().cycles
    }

    /// Sum of all pauses.
    pub fn total_pause(&self) -> Duration {
        self.totals.lock().total_pause
    }

    /// Longest pause.
    pub fn max_pause(&self) -> Duration {
        self.totals.lock().max_pause
    }

    /// Bytes reclaimed since start.
    pub fn freed_bytes(&self) -> usize {
        self.totals.lock().freed_bytes
    }
}

/// Observer of collector activity.
///
/// Callbacks run on the collecting thread, inside the pause for pause
/// phases; they must not allocate in the managed heap.
pub trait GcListener: Send + Sync {
    /// A phase begins.
    fn gc_phase_started(&self, _phase: GcPhase) {}

    /// A phase ends.
    fn gc_phase_finished(&self, _phase: GcPhase) {}

    /// A cycle was recorded.
    fn gc_finished(&self, _record: &CycleRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: GcCollectionType, ms: u64) -> CycleRecord {
        let mut r = CycleRecord::new(kind, GcTaskCause::Young, format!("[{kind} (Young)]"));
        r.pause = Duration::from_millis(ms);
        r.freed_bytes = 100;
        r
    }

    #[test]
    fn totals_and_history() {
        let stats = GcStats::new();
        stats.record(record(GcCollectionType::Young, 2));
        stats.record(record(GcCollectionType::Mixed, 5));
        stats.record(record(GcCollectionType::Young, 1));
        assert_eq!(stats.cycles(), 3);
        assert_eq!(stats.total_pause(), Duration::from_millis(8));
        assert_eq!(stats.max_pause(), Duration::from_millis(5));
        assert_eq!(stats.freed_bytes(), 300);
        assert_eq!(stats.count_of(GcCollectionType::Young), 2);
        assert_eq!(stats.last().unwrap().kind, GcCollectionType::Young);
        assert_eq!(stats.phase_lines()[1], "[MIXED (Young)]");
    }

    #[test]
    fn history_is_bounded() {
        let stats = GcStats::new();
        for _ in 0..MAX_CYCLE_RECORDS + 5 {
            stats.record(record(GcCollectionType::Young, 0));
        }
        assert_eq!(stats.records().len(), MAX_CYCLE_RECORDS);
        assert_eq!(stats.cycles(), (MAX_CYCLE_RECORDS + 5) as u64);
    }

    #[test]
    fn merge_adds_counters() {
        let mut a = record(GcCollectionType::Full, 1);
        a.merge(&record(GcCollectionType::Full, 2));
        assert_eq!(a.pause, Duration::from_millis(3));
        assert_eq!(a.freed_bytes, 200);
    }
}
