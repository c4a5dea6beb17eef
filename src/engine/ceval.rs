//! Cache pre-evaluation: decide an object's fate from cached results alone,
//! before it reaches the evaluation queue.
//!
//! At search start the session snapshots the permutation's (name, filter
//! signature, threshold) triples here. The object-disk loader then runs
//! `preflight` on every fetched object: a below-threshold hit means the
//! object was already rejected in an identical context and is dropped
//! without evaluation; passing hits are combined so deeper filters can hit
//! too.

use std::sync::{Mutex, RwLock};
use std::time::Instant;

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::attr::{filter_time_attr, FILTER_TOTAL_TIME};
use super::cache::ObjectCache;
use super::object::ObjectData;
use super::sig::Signature;

#[derive(Debug, Clone)]
pub struct FilterSnapshot {
    pub name: String,
    pub sig: Signature,
    pub threshold: i64,
}

/// Outcome of the cached pre-screen.
pub enum Preflight {
    /// A cached result rejects the object; release it.
    Drop,
    /// Evaluate, with cached results already committed for a prefix of the
    /// permutation: (filter name, cache entry) pairs.
    Evaluate { hits: Vec<(String, i64)> },
}

pub struct CacheEval {
    cache: Arc<ObjectCache>,
    snapshot: RwLock<Vec<FilterSnapshot>>,
    /// Names re-queued by the work-ahead path; drained by the loader.
    injected: Mutex<Vec<String>>,
}

impl CacheEval {
    pub fn new(cache: Arc<ObjectCache>) -> Self {
        CacheEval {
            cache,
            snapshot: RwLock::new(Vec::new()),
            injected: Mutex::new(Vec::new()),
        }
    }

    /// Install the filter set for a new search.
    pub fn init_search(&self, filters: Vec<FilterSnapshot>) {
        *self.snapshot.write().unwrap() = filters;
    }

    pub fn inject_names(&self, names: Vec<String>) {
        self.injected.lock().unwrap().extend(names);
    }

    pub fn take_injected(&self) -> Vec<String> {
        std::mem::take(&mut *self.injected.lock().unwrap())
    }

    /// Screen one object against the cache. The object's baseline must
    /// already be recorded.
    #[instrument(skip(self, obj), fields(obj = %obj.id_sig), level = "debug")]
    pub async fn preflight(&self, obj: &ObjectData) -> Result<Preflight> {
        let filters = self.snapshot.read().unwrap().clone();
        if filters.is_empty() || !self.cache.is_enabled() {
            return Ok(Preflight::Evaluate { hits: Vec::new() });
        }

        let _ctx = self.cache.lock_context().await;
        self.cache.reset_current(&obj.id_sig).await?;

        let mut hits = Vec::new();
        for f in &filters {
            match self.cache.lookup(&obj.id_sig, &f.sig).await? {
                Some(hit) if hit.score < f.threshold => {
                    debug!(filter = %f.name, score = hit.score, "cached drop");
                    return Ok(Preflight::Drop);
                }
                Some(hit) => {
                    self.cache.combine(hit.entry).await?;
                    hits.push((f.name.clone(), hit.entry));
                }
                None => break,
            }
        }
        Ok(Preflight::Evaluate { hits })
    }

    /// Reconstruct cached output attributes for preflight hits and stamp
    /// the reconstruction times the way executed filters stamp execution
    /// times.
    pub async fn load_cached_attrs(
        &self,
        obj: &mut ObjectData,
        hits: &[(String, i64)],
    ) -> Result<()> {
        let mut total_ns: u64 = 0;
        for (name, entry) in hits {
            let started = Instant::now();
            let loaded = self.cache.read_oattrs(&mut obj.attrs, *entry).await?;
            if loaded {
                let elapsed = started.elapsed().as_nanos() as u64;
                total_ns += elapsed;
                obj.attrs
                    .write(&filter_time_attr(name), &elapsed.to_le_bytes())
                    .ok();
            }
        }
        if total_ns > 0 {
            obj.attrs
                .write(FILTER_TOTAL_TIME, &total_ns.to_le_bytes())
                .ok();
        }
        Ok(())
    }
}
