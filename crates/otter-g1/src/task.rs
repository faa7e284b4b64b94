//! Collection requests.

use std::fmt;
use std::time::Instant;

/// Why a collection was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcTaskCause {
    /// Eden is exhausted
    Young,
    /// Heap occupancy crossed the tenured threshold
    HeapUsageThreshold,
    /// An allocation failed even after a young collection
    Oom,
    /// Requested by the runtime or the program
    Explicit,
    /// A mixed collection is forced
    Mixed,
    /// Application startup finished
    StartupComplete,
    /// Native allocations crossed their threshold
    NativeAlloc,
}

impl fmt::Display for GcTaskCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcTaskCause::Young => "Young",
            GcTaskCause::HeapUsageThreshold => "Threshold",
            GcTaskCause::Oom => "OOM",
            GcTaskCause::Explicit => "Explicit",
            GcTaskCause::Mixed => "Mixed",
            GcTaskCause::StartupComplete => "Startup",
            GcTaskCause::NativeAlloc => "NativeAlloc",
        };
        f.write_str(name)
    }
}

/// Kind of work a cycle performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcCollectionType {
    /// Nothing was collected
    None,
    /// Young regions only
    Young,
    /// Young regions plus selected old regions
    Mixed,
    /// Concurrent marking of the whole heap
    ConcurrentMark,
    /// Full compacting collection
    Full,
}

impl fmt::Display for GcCollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcCollectionType::None => "NONE",
            GcCollectionType::Young => "YOUNG",
            GcCollectionType::Mixed => "MIXED",
            GcCollectionType::ConcurrentMark => "CONCURRENT MARK",
            GcCollectionType::Full => "FULL",
        };
        f.write_str(name)
    }
}

/// A collection request.
#[derive(Debug, Clone)]
pub struct GcTask {
    /// Reason for the request
    pub cause: GcTaskCause,
    /// What the cycle ended up doing, set by the collector
    pub collection_type: GcCollectionType,
    /// When the request was made
    pub created: Instant,
}

impl GcTask {
    /// New request for `cause`.
    pub fn new(cause: GcTaskCause) -> Self {
        Self {
            cause,
            collection_type: GcCollectionType::None,
            created: Instant::now(),
        }
    }

    /// Log line tag such as `[YOUNG (Explicit)]`.
    pub fn phase_line(&self, kind: GcCollectionType) -> String {
        format!("[{kind} ({})]", self.cause)
    }

    /// Whether the cause may start concurrent marking.
    pub fn starts_concurrent_mark(&self) -> bool {
        matches!(
            self.cause,
            GcTaskCause::HeapUsageThreshold | GcTaskCause::StartupComplete
        )
    }
}
