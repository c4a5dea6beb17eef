//! The filter table: parsed pipeline descriptors, dependency order,
//! per-filter statistics and the current execution permutation.
//!
//! A descriptor is plaintext, one keyword per line:
//!
//! ```text
//! FILTER rgb
//! THRESHOLD 1
//! EVAL_FUNCTION f_eval_rgb
//!
//! FILTER circles
//! THRESHOLD 50
//! EVAL_FUNCTION f_eval_circles
//! ARG 0.8
//! REQUIRES rgb
//! ```
//!
//! Dependencies form a DAG; the initial permutation is a topological sort.
//! A block named `APPLICATION` only anchors dependencies and is never
//! executed.

use std::time::Instant;

use super::bypass::{BYPASS_MAX, FSTATS_UNKNOWN_COST, FSTATS_UNKNOWN_NUM, FSTATS_UNKNOWN_PROB, FSTATS_VALID_NUM};
use super::ceval::FilterSnapshot;
use super::error::EngineError;
use super::exec::FilterCode;
use super::sig::Signature;
use super::stats::FilterStatsSnapshot;

pub const MAX_FILTER_NAME: usize = 128;
pub const APPLICATION_FILTER: &str = "APPLICATION";

/// Size of the per-object wall-time history ring.
pub const STAT_WINDOW: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterOutputType {
    #[default]
    Unmodified,
    New,
    Clone,
    CopyAttr,
}

#[derive(Debug, Default, Clone)]
pub struct FilterStats {
    pub called: u64,
    pub dropped: u64,
    pub passed: u64,
    pub errored: u64,
    pub time_ns: u64,
    pub added_bytes: u64,
    pub cache_drop: u64,
    pub cache_pass: u64,
    pub compute: u64,
    pub hits_inter_session: u64,
    pub hits_inter_query: u64,
    pub hits_intra_query: u64,
}

impl FilterStats {
    /// Measured (cost, samples) pair, falling back to priors until enough
    /// calls have been observed.
    pub fn cost_sample(&self) -> (f64, f64) {
        if self.called < FSTATS_VALID_NUM {
            (FSTATS_UNKNOWN_COST, FSTATS_UNKNOWN_NUM)
        } else {
            (self.time_ns as f64, self.called as f64)
        }
    }

    pub fn pass_rate(&self) -> f64 {
        if self.called < FSTATS_VALID_NUM {
            FSTATS_UNKNOWN_PROB
        } else {
            self.passed as f64 / self.called as f64
        }
    }
}

pub struct FilterInfo {
    pub name: String,
    pub eval_name: String,
    pub init_name: String,
    pub threshold: i64,
    pub merit: i64,
    pub args: Vec<String>,
    pub deps: Vec<String>,
    pub output_type: FilterOutputType,
    pub blob: Vec<u8>,
    pub blob_sig: Signature,
    /// Content signature over (library sigs, name, eval function, args,
    /// blob). Identical signatures imply identical observable behavior.
    pub sig: Signature,
    /// Bypass threshold in [-1, BYPASS_MAX]; run when the per-object draw
    /// is <= this.
    pub bp_thresh: i32,
    pub firstgroup: bool,
    pub stats: FilterStats,
    pub code: Option<Box<dyn FilterCode>>,
    pub initialized: bool,
}

pub struct FilterTable {
    pub filters: Vec<FilterInfo>,
    /// Indices into `filters`, in execution order. Always consistent with
    /// the dependency partial order.
    pub permutation: Vec<usize>,
    /// depends_on[i][j]: filter i (transitively) requires filter j.
    depends_on: Vec<Vec<bool>>,
    pub libs: Vec<Signature>,
    pub spec_sig: Signature,
    obj_ns: Vec<u64>,
    obj_ns_pos: usize,
    obj_ns_valid: usize,
    exec_ns: Vec<u64>,
    /// Mean wall seconds per object over the stats window.
    pub fd_avg_wall: f64,
    pub fd_avg_exec: f64,
    pub search_started: Option<Instant>,
}

impl FilterTable {
    /// Parse a filter descriptor and build the initial permutation.
    pub fn from_spec(text: &str, spec_sig: Signature) -> Result<Self, EngineError> {
        let mut filters = parse_spec(text)?;
        if filters.is_empty() {
            return Err(EngineError::InvalidInput(
                "spec defines no filters".to_string(),
            ));
        }

        for f in &mut filters {
            if f.eval_name.is_empty() {
                return Err(EngineError::InvalidInput(format!(
                    "filter {} has no eval function",
                    f.name
                )));
            }
        }

        let mut table = FilterTable {
            filters,
            permutation: Vec::new(),
            depends_on: Vec::new(),
            libs: Vec::new(),
            spec_sig,
            obj_ns: vec![0; STAT_WINDOW],
            obj_ns_pos: 0,
            obj_ns_valid: 0,
            exec_ns: vec![0; STAT_WINDOW],
            fd_avg_wall: 0.0,
            fd_avg_exec: 0.0,
            search_started: None,
        };
        table.resolve_deps()?;
        table.resign();
        Ok(table)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.filters.iter().position(|f| f.name == name)
    }

    /// Build the transitive dependency matrix and a topological initial
    /// permutation.
    fn resolve_deps(&mut self) -> Result<(), EngineError> {
        let n = self.filters.len();
        let mut direct = vec![vec![false; n]; n];
        for i in 0..n {
            for dep in self.filters[i].deps.clone() {
                let j = self.index_of(&dep).ok_or_else(|| {
                    EngineError::InvalidInput(format!(
                        "filter {} requires unknown filter {dep}",
                        self.filters[i].name
                    ))
                })?;
                direct[i][j] = true;
            }
        }

        // transitive closure
        let mut depends = direct.clone();
        for k in 0..n {
            for i in 0..n {
                if depends[i][k] {
                    for j in 0..n {
                        if depends[k][j] {
                            depends[i][j] = true;
                        }
                    }
                }
            }
        }
        for (i, row) in depends.iter().enumerate() {
            if row[i] {
                return Err(EngineError::InvalidInput(format!(
                    "dependency cycle through filter {}",
                    self.filters[i].name
                )));
            }
        }
        self.depends_on = depends;

        self.permutation = self.order_by(|_| 0.0)?;
        Ok(())
    }

    /// Produce a permutation consistent with the partial order, choosing
    /// the lowest-keyed ready filter at each step.
    fn order_by<K: Fn(&FilterInfo) -> f64>(&self, key: K) -> Result<Vec<usize>, EngineError> {
        let n = self.filters.len();
        let mut placed = vec![false; n];
        let mut order = Vec::with_capacity(n);
        while order.len() < n {
            let mut best: Option<(usize, f64)> = None;
            for i in 0..n {
                if placed[i] {
                    continue;
                }
                let ready = (0..n).all(|j| !self.depends_on[i][j] || placed[j]);
                if !ready {
                    continue;
                }
                let k = key(&self.filters[i]);
                if best.map_or(true, |(_, bk)| k < bk) {
                    best = Some((i, k));
                }
            }
            let (i, _) = best.ok_or_else(|| {
                EngineError::InvalidInput("dependency cycle in filter spec".to_string())
            })?;
            placed[i] = true;
            order.push(i);
        }
        Ok(order)
    }

    /// Re-derive the permutation from live statistics: cheapest measured
    /// per-call cost first, under the dependency partial order.
    pub fn optimize_order(&mut self) {
        if let Ok(order) = self.order_by(|f| {
            let (c, n) = f.stats.cost_sample();
            c / n
        }) {
            self.permutation = order;
        }
    }

    /// Recompute every filter's content signature from the current library
    /// set, arguments and blob.
    pub fn resign(&mut self) {
        let libs = self.libs.clone();
        for f in &mut self.filters {
            let mut ranges: Vec<&[u8]> = Vec::new();
            for lib in &libs {
                ranges.push(lib.as_bytes());
            }
            ranges.push(f.name.as_bytes());
            ranges.push(f.eval_name.as_bytes());
            for arg in &f.args {
                ranges.push(arg.as_bytes());
            }
            if !f.blob.is_empty() {
                ranges.push(&f.blob);
            }
            f.sig = Signature::hash(&ranges);
        }
    }

    /// Register a supporting code object; part of every filter signature.
    pub fn add_lib(&mut self, sig: Signature) {
        self.libs.push(sig);
        self.resign();
    }

    /// Bind a blob to a named filter. Discards any instantiated filter code
    /// so the next execution picks the blob up.
    pub fn set_blob(&mut self, name: &str, blob: Vec<u8>) -> Result<(), EngineError> {
        let i = self
            .index_of(name)
            .ok_or_else(|| EngineError::InvalidInput(format!("no filter named {name}")))?;
        self.filters[i].blob_sig = Signature::hash_bytes(&blob);
        self.filters[i].blob = blob;
        self.filters[i].code = None;
        self.filters[i].initialized = false;
        self.resign();
        Ok(())
    }

    pub fn clear_stats(&mut self) {
        for f in &mut self.filters {
            f.stats = FilterStats::default();
        }
        self.obj_ns_pos = 0;
        self.obj_ns_valid = 0;
        self.fd_avg_wall = 0.0;
        self.fd_avg_exec = 0.0;
    }

    /// Record one object's wall and execute time into the history window.
    pub fn record_obj_time(&mut self, wall_ns: u64, exec_ns: u64) {
        self.obj_ns[self.obj_ns_pos] = wall_ns;
        self.exec_ns[self.obj_ns_pos] = exec_ns;
        self.obj_ns_pos = (self.obj_ns_pos + 1) % STAT_WINDOW;
        self.obj_ns_valid = (self.obj_ns_valid + 1).min(STAT_WINDOW);

        let n = self.obj_ns_valid as f64;
        let wall_sum: u64 = self.obj_ns[..self.obj_ns_valid].iter().sum();
        let exec_sum: u64 = self.exec_ns[..self.obj_ns_valid].iter().sum();
        self.fd_avg_wall = wall_sum as f64 / n / 1e9;
        self.fd_avg_exec = exec_sum as f64 / n / 1e9;
    }

    /// Expected pipeline cost per object (ns) under the current permutation,
    /// the greedy reconstruction used for bypass targets.
    pub fn estimate_cost(&self) -> f64 {
        let mut pass = 1.0f64;
        let mut cost = 0.0f64;
        for &i in &self.permutation {
            let f = &self.filters[i];
            let (c, n) = f.stats.cost_sample();
            cost += pass * c / n;
            pass = (pass * f.stats.pass_rate()).max(super::bypass::SMALL_FRACTION);
        }
        cost
    }

    /// Snapshot for the object-disk pre-evaluation stage.
    pub fn ceval_snapshot(&self) -> Vec<FilterSnapshot> {
        self.permutation
            .iter()
            .map(|&i| FilterSnapshot {
                name: self.filters[i].name.clone(),
                sig: self.filters[i].sig,
                threshold: self.filters[i].threshold,
            })
            .collect()
    }

    pub fn stats_snapshot(&self) -> Vec<FilterStatsSnapshot> {
        self.filters
            .iter()
            .map(|f| FilterStatsSnapshot {
                name: f.name.clone(),
                called: f.stats.called,
                dropped: f.stats.dropped,
                cache_drop: f.stats.cache_drop,
                cache_pass: f.stats.cache_pass,
                compute: f.stats.compute,
                hits_inter_session: f.stats.hits_inter_session,
                hits_inter_query: f.stats.hits_inter_query,
                hits_intra_query: f.stats.hits_intra_query,
                avg_exec_time_ns: if f.stats.called > 0 {
                    f.stats.time_ns / f.stats.called
                } else {
                    0
                },
            })
            .collect()
    }
}

fn parse_spec(text: &str) -> Result<Vec<FilterInfo>, EngineError> {
    let mut filters: Vec<FilterInfo> = Vec::new();
    let mut application_deps: Vec<String> = Vec::new();
    let mut current: Option<FilterInfo> = None;
    let mut in_application = false;

    let bad = |line: &str, why: &str| EngineError::InvalidInput(format!("{why}: {line:?}"));

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (line, ""),
        };

        if keyword == "FILTER" {
            if let Some(f) = current.take() {
                filters.push(f);
            }
            if rest.is_empty() || rest.len() > MAX_FILTER_NAME {
                return Err(bad(line, "bad filter name"));
            }
            in_application = rest == APPLICATION_FILTER;
            if !in_application {
                if filters.iter().any(|f| f.name == rest) {
                    return Err(bad(line, "duplicate filter name"));
                }
                current = Some(FilterInfo {
                    name: rest.to_string(),
                    eval_name: String::new(),
                    init_name: String::new(),
                    threshold: 0,
                    merit: 0,
                    args: Vec::new(),
                    deps: Vec::new(),
                    output_type: FilterOutputType::default(),
                    blob: Vec::new(),
                    blob_sig: Signature::default(),
                    sig: Signature::default(),
                    bp_thresh: BYPASS_MAX,
                    firstgroup: false,
                    stats: FilterStats::default(),
                    code: None,
                    initialized: false,
                });
            }
            continue;
        }

        if in_application {
            // the APPLICATION block anchors the DAG; only its dependency
            // lines matter
            if keyword == "REQUIRES" {
                application_deps.extend(rest.split_whitespace().map(str::to_string));
            }
            continue;
        }

        let f = current
            .as_mut()
            .ok_or_else(|| bad(line, "keyword before any FILTER"))?;

        match keyword {
            "THRESHOLD" => {
                f.threshold = rest.parse().map_err(|_| bad(line, "bad threshold"))?;
            }
            "MERIT" => {
                f.merit = rest.parse().map_err(|_| bad(line, "bad merit"))?;
            }
            "EVAL_FUNCTION" => f.eval_name = rest.to_string(),
            "INIT_FUNCTION" => f.init_name = rest.to_string(),
            "ARG" => f.args.push(rest.to_string()),
            "REQUIRES" => {
                f.deps.extend(rest.split_whitespace().map(str::to_string));
            }
            "OUTPUT_TYPE" => {
                f.output_type = match rest {
                    "unmodified" => FilterOutputType::Unmodified,
                    "new" => FilterOutputType::New,
                    "clone" => FilterOutputType::Clone,
                    "copy_attr" => FilterOutputType::CopyAttr,
                    _ => return Err(bad(line, "bad output type")),
                };
            }
            _ => return Err(bad(line, "unknown keyword")),
        }
    }
    if let Some(f) = current.take() {
        filters.push(f);
    }

    for dep in application_deps {
        if !filters.iter().any(|f| f.name == dep) {
            return Err(EngineError::InvalidInput(format!(
                "application requires unknown filter {dep}"
            )));
        }
    }

    Ok(filters)
}
