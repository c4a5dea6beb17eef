//! Search statistics: live counters and poll snapshots.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Counters owned by the search worker and the object-disk loader. Readers
/// observe a possibly-inconsistent but monotonically non-decreasing
/// snapshot. Individually shareable so the control tree can expose each
/// one as a leaf.
#[derive(Default)]
pub struct SessionCounters {
    pub obj_processed: Arc<AtomicU32>,
    pub obj_dropped: Arc<AtomicU32>,
    pub obj_passed: Arc<AtomicU32>,
    pub obj_skipped: Arc<AtomicU32>,
    pub tx_full_stalls: Arc<AtomicU32>,
    pub tx_idles: Arc<AtomicU32>,
    pub searches: Arc<AtomicU32>,
    pub pend_objs: Arc<AtomicI64>,
}

impl SessionCounters {
    pub fn clear_search(&self) {
        self.obj_processed.store(0, Ordering::Relaxed);
        self.obj_dropped.store(0, Ordering::Relaxed);
        self.obj_passed.store(0, Ordering::Relaxed);
        self.obj_skipped.store(0, Ordering::Relaxed);
        self.tx_full_stalls.store(0, Ordering::Relaxed);
        self.tx_idles.store(0, Ordering::Relaxed);
    }

    pub fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-filter snapshot handed to a polling caller.
#[derive(Debug, Clone, Serialize)]
pub struct FilterStatsSnapshot {
    pub name: String,
    pub called: u64,
    pub dropped: u64,
    pub cache_drop: u64,
    pub cache_pass: u64,
    pub compute: u64,
    pub hits_inter_session: u64,
    pub hits_inter_query: u64,
    pub hits_intra_query: u64,
    pub avg_exec_time_ns: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchStats {
    pub objs_total: i64,
    pub objs_processed: u32,
    pub objs_dropped: u32,
    pub objs_skipped: u32,
    pub system_load_pct: u32,
    pub avg_obj_time_ms: f64,
    pub filters: Vec<FilterStatsSnapshot>,
}
