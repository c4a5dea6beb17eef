//! Bypass threshold and billing-group computation.
//!
//! Each filter carries an integer threshold in [-1, BYPASS_MAX]; at
//! scheduling time a uniform draw decides whether the filter runs here or
//! is left for the client to finish. The policies distribute a target CPU
//! budget (a ratio of the measured average pipeline cost) over the current
//! permutation.

use tracing::debug;

use super::config::BypassPolicy;
use super::filter::FilterTable;

pub const BYPASS_MAX: i32 = i32::MAX;

/// Stats are trusted once a filter has this many calls.
pub const FSTATS_VALID_NUM: u64 = 10;
pub const FSTATS_UNKNOWN_PROB: f64 = 0.5;
/// Prior cost for an unmeasured filter: 30 ms expressed in ns.
pub const FSTATS_UNKNOWN_COST: f64 = 30_000_000.0;
pub const FSTATS_UNKNOWN_NUM: f64 = 1.0;

/// Floor for cumulative pass rates and incremental costs.
pub const SMALL_FRACTION: f64 = 0.00001;

/// Recompute per-filter bypass thresholds from live stats. Also re-derives
/// the permutation so the cheapest certain filters run first.
pub fn update_bypass(table: &mut FilterTable, policy: BypassPolicy, ratio: f64) {
    table.optimize_order();

    let target = table.estimate_cost() * ratio;
    debug!(?policy, ratio, target, "updating bypass thresholds");

    match policy {
        BypassPolicy::None => set_bypass_none(table),
        BypassPolicy::Simple => set_bypass_trivial(table, ratio),
        BypassPolicy::Greedy => set_bypass_greedy(table, target),
        BypassPolicy::Hybrid => set_bypass_hybrid(table, target),
    }
}

/// Recompute the firstgroup markers used for cost attribution.
pub fn update_grouping(table: &mut FilterTable, policy: BypassPolicy, ratio: f64) {
    match policy {
        BypassPolicy::None => {
            for f in &mut table.filters {
                f.firstgroup = false;
            }
        }
        BypassPolicy::Simple => {
            let perm = table.permutation.clone();
            for (pos, &i) in perm.iter().enumerate() {
                table.filters[i].firstgroup = pos == 0;
            }
        }
        BypassPolicy::Greedy => {
            for f in &mut table.filters {
                f.firstgroup = true;
            }
        }
        BypassPolicy::Hybrid => {
            let target = table.estimate_cost() * ratio;
            set_grouping_hybrid(table, target);
        }
    }
}

fn set_bypass_none(table: &mut FilterTable) {
    for f in &mut table.filters {
        f.bp_thresh = BYPASS_MAX;
    }
}

/// Split only the first filter in the permutation.
fn set_bypass_trivial(table: &mut FilterTable, ratio: f64) {
    let perm = table.permutation.clone();
    if let Some(&first) = perm.first() {
        table.filters[first].bp_thresh = if ratio >= 1.0 {
            BYPASS_MAX
        } else {
            (BYPASS_MAX as f64 * ratio) as i32
        };
    }
    for &i in perm.iter().skip(1) {
        table.filters[i].bp_thresh = BYPASS_MAX;
    }
}

/// Walk the permutation accumulating expected cost; the filter that crosses
/// the target gets a fractional threshold, everything past it is bypassed.
fn set_bypass_greedy(table: &mut FilterTable, target: f64) {
    let perm = table.permutation.clone();
    let mut pass = 1.0f64;
    let mut old_cost = 0.0f64;

    for &i in &perm {
        if old_cost > target {
            table.filters[i].bp_thresh = -1;
            continue;
        }

        let (c, n) = table.filters[i].stats.cost_sample();
        let new_cost = old_cost + pass * c / n;

        if new_cost > target {
            let ratio = (target - old_cost) / (new_cost - old_cost);
            table.filters[i].bp_thresh = (BYPASS_MAX as f64 * ratio) as i32;
        } else {
            table.filters[i].bp_thresh = BYPASS_MAX;
        }

        pass = (pass * table.filters[i].stats.pass_rate()).max(SMALL_FRACTION);
        old_cost = new_cost;
    }
}

/// Per-position state for the hybrid distribution: the cumulative CPU cost
/// up to (not including) each filter, the network bytes the greedy
/// distribution would transmit at that cost, and the unit subsequence each
/// position belongs to.
#[derive(Clone, Copy, Default)]
struct HybridState {
    dcost: f64,
    greedy_ncost: f64,
    unit_begin: usize,
    unit_end: usize,
    c_i: f64,
    c_j: f64,
}

fn hybrid_reconstruct(table: &FilterTable, initial_maxbytes: f64) -> Vec<HybridState> {
    let perm = &table.permutation;
    let mut hstate = vec![HybridState::default(); perm.len() + 1];

    let mut dcost = 0.0f64;
    let mut pass = 1.0f64;
    let mut maxbytes = initial_maxbytes;

    for (pos, &i) in perm.iter().enumerate() {
        hstate[pos].dcost = dcost;
        hstate[pos].greedy_ncost = pass * maxbytes;

        let f = &table.filters[i];
        let (c, n) = f.stats.cost_sample();
        maxbytes += f.stats.added_bytes as f64 / n;

        let this_cost = (pass * c / n).max(SMALL_FRACTION);
        dcost += this_cost;

        pass = (pass * f.stats.pass_rate()).max(SMALL_FRACTION);
    }
    hstate[perm.len()].dcost = dcost;
    hstate[perm.len()].greedy_ncost = pass * maxbytes;

    // identify the unit subsequences: for each start, the end that
    // maximizes byte reduction per unit of CPU cost
    let n = perm.len();
    let mut pos = 0;
    while pos < n {
        let mut lowest_delta = f64::INFINITY;
        let mut best_end = pos + 1;
        for end in pos + 1..=n {
            let delta = (hstate[end].greedy_ncost - hstate[pos].greedy_ncost)
                / (hstate[end].dcost - hstate[pos].dcost);
            if delta < lowest_delta {
                lowest_delta = delta;
                best_end = end;
            }
        }
        for k in pos..best_end {
            hstate[k].unit_begin = pos;
            hstate[k].unit_end = best_end;
            hstate[k].c_i = hstate[pos].dcost;
            hstate[k].c_j = hstate[best_end].dcost;
        }
        pos = best_end;
    }

    hstate
}

/// Network-optimal distribution: the target cost falls inside exactly one
/// contiguous unit, whose first filter gets the fractional threshold while
/// the rest of the unit always runs and everything past it never does.
fn set_bypass_hybrid(table: &mut FilterTable, target: f64) {
    let perm = table.permutation.clone();
    if perm.is_empty() {
        return;
    }
    let hstate = hybrid_reconstruct(table, 300_000.0);

    let mut pos = perm.len();
    for (p, h) in hstate.iter().enumerate().take(perm.len() + 1) {
        if h.dcost > target {
            pos = p.saturating_sub(1);
            break;
        }
    }
    if pos >= perm.len() {
        pos = perm.len() - 1;
    }

    let unit = hstate[pos];
    for &i in perm.iter().take(unit.unit_begin) {
        table.filters[i].bp_thresh = BYPASS_MAX;
    }

    let ratio = ((target - unit.c_i) / (unit.c_j - unit.c_i)).min(1.0);
    table.filters[perm[unit.unit_begin]].bp_thresh = (BYPASS_MAX as f64 * ratio) as i32;

    for &i in perm.iter().take(unit.unit_end).skip(unit.unit_begin + 1) {
        table.filters[i].bp_thresh = BYPASS_MAX;
    }
    for &i in perm.iter().skip(unit.unit_end) {
        table.filters[i].bp_thresh = -1;
    }
}

fn set_grouping_hybrid(table: &mut FilterTable, _target: f64) {
    let perm = table.permutation.clone();
    if perm.is_empty() {
        return;
    }
    let hstate = hybrid_reconstruct(table, 100.0);
    for (pos, &i) in perm.iter().enumerate() {
        table.filters[i].firstgroup = hstate[pos].unit_begin == pos;
    }
}
