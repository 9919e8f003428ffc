//! Collection statistics.

use crate::concurrent_gc::{CollectionKind, CollectorPhase};
use serde::Serialize;

/// Outcome of one collection cycle, produced by the collector thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    /// Minor (aging generation only) or major (aging and old).
    pub kind: CollectionKind,
    /// Objects blackened by the collector thread.
    pub objects_marked: usize,
    /// Objects returned to the allocator.
    pub objects_freed: usize,
    /// Bytes returned to the allocator, headers included.
    pub bytes_freed: usize,
    /// Weak references whose referent died.
    pub weakrefs_cleared: usize,
    /// Dead objects queued for finalization.
    pub finalizers_scheduled: usize,
    /// Size of the old generation after the sweep.
    pub old_bytes_after: usize,
    /// Wall-clock duration of the cycle on the collector thread.
    pub duration_us: u64,
}

/// Totals over all completed cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleTotals {
    pub minor_cycles: u64,
    pub major_cycles: u64,
    pub objects_freed: u64,
    pub bytes_freed: u64,
    pub weakrefs_cleared: u64,
    pub finalizers_run: u64,
    pub collector_time_us: u64,
}

impl CycleTotals {
    pub(crate) fn record(&mut self, cycle: &CycleStats) {
        match cycle.kind {
            CollectionKind::Minor => self.minor_cycles += 1,
            CollectionKind::Major => self.major_cycles += 1,
        }
        self.objects_freed += cycle.objects_freed as u64;
        self.bytes_freed += cycle.bytes_freed as u64;
        self.weakrefs_cleared += cycle.weakrefs_cleared as u64;
        self.collector_time_us += cycle.duration_us;
    }

    /// Completed cycles of either kind.
    pub fn cycles(&self) -> u64 {
        self.minor_cycles + self.major_cycles
    }
}

/// Snapshot of the heap, returned by [`Heap::stats`](crate::Heap::stats).
#[derive(Debug, Clone, Serialize)]
pub struct HeapStats {
    pub phase: CollectorPhase,
    /// Objects allocated since the last trigger.
    pub young_objects: usize,
    pub young_bytes: usize,
    /// Old generation as of the last completed sweep.
    pub old_objects: usize,
    pub old_bytes: usize,
    pub arena_bytes: usize,
    pub large_bytes: usize,
    pub pages_in_use: usize,
    pub free_pages: usize,
    pub pending_finalizers: usize,
    pub totals: CycleTotals,
    pub last_cycle: Option<CycleStats>,
}
