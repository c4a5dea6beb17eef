//! Filter-run history and saved searchlet configurations.
//!
//! Every finished search leaves a trace: per-filter execution totals
//! appended to a history file, and the searchlet itself (spec signature,
//! supporting code objects, blob bindings) saved under the spec signature.
//! An idle server can walk the history, pick searchlets that have not run
//! recently, and re-run them purely to warm the result cache.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::filter::FilterTable;
use super::sig::Signature;

/// Re-run a remembered searchlet when it has been idle this long (seconds).
pub const REFRESH_AGE_SECS: i64 = 1800;

const HISTORY_FILE: &str = "filter_history";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterHistoryEntry {
    pub filter_sig: Signature,
    /// Searches this filter took part in.
    pub executions: u64,
    /// Objects those searches examined.
    pub search_objects: u64,
    /// Objects this filter was invoked on.
    pub filter_objects: u64,
    pub drop_objects: u64,
    /// Unix seconds of the last run.
    pub last_run: i64,
}

/// Persistent per-filter run totals, one line per filter signature.
pub struct FilterHistory {
    path: PathBuf,
    entries: Vec<FilterHistoryEntry>,
}

impl FilterHistory {
    /// Load the history from `dir`, tolerating a missing file.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(HISTORY_FILE);
        let mut entries = Vec::new();

        if let Ok(text) = std::fs::read_to_string(&path) {
            for line in text.lines() {
                match parse_history_line(line) {
                    Some(entry) => entries.push(entry),
                    None => warn!("skipping malformed history line: {line:?}"),
                }
            }
        }
        debug!(entries = entries.len(), "filter history loaded");
        FilterHistory { path, entries }
    }

    pub fn save(&self) -> Result<()> {
        let mut out = String::new();
        for e in &self.entries {
            out.push_str(&format!(
                "{} {} {} {} {} {}\n",
                e.filter_sig.to_filename(),
                e.executions,
                e.search_objects,
                e.filter_objects,
                e.drop_objects,
                e.last_run
            ));
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, out)
            .with_context(|| format!("writing {}", self.path.display()))
    }

    fn find(&mut self, sig: &Signature) -> &mut FilterHistoryEntry {
        if let Some(i) = self.entries.iter().position(|e| e.filter_sig == *sig) {
            return &mut self.entries[i];
        }
        self.entries.push(FilterHistoryEntry {
            filter_sig: *sig,
            executions: 0,
            search_objects: 0,
            filter_objects: 0,
            drop_objects: 0,
            last_run: 0,
        });
        self.entries.last_mut().unwrap()
    }

    /// Fold one finished search's totals into the history.
    pub fn record_search(&mut self, table: &FilterTable, objs_processed: u64, now: i64) {
        for f in &table.filters {
            let entry = self.find(&f.sig);
            entry.executions += 1;
            entry.search_objects += objs_processed;
            entry.filter_objects += f.stats.called + f.stats.cache_pass + f.stats.cache_drop;
            entry.drop_objects += f.stats.dropped + f.stats.cache_drop;
            entry.last_run = now;
        }
        self.sort();
    }

    /// Most-executed first; the ordering background refresh walks.
    pub fn sort(&mut self) {
        self.entries.sort_by(|a, b| b.executions.cmp(&a.executions));
    }

    /// Filters whose last run is older than [`REFRESH_AGE_SECS`], in
    /// descending execution count.
    pub fn stale(&self, now: i64) -> Vec<&FilterHistoryEntry> {
        self.entries
            .iter()
            .filter(|e| now - e.last_run > REFRESH_AGE_SECS)
            .collect()
    }

    pub fn entries(&self) -> &[FilterHistoryEntry] {
        &self.entries
    }
}

fn parse_history_line(line: &str) -> Option<FilterHistoryEntry> {
    let mut parts = line.split_whitespace();
    Some(FilterHistoryEntry {
        filter_sig: Signature::from_hex(parts.next()?)?,
        executions: parts.next()?.parse().ok()?,
        search_objects: parts.next()?.parse().ok()?,
        filter_objects: parts.next()?.parse().ok()?,
        drop_objects: parts.next()?.parse().ok()?,
        last_run: parts.next()?.parse().ok()?,
    })
}

/// The installed searchlet, persisted so a background run can reconstruct
/// it: the spec, its supporting code objects, and blob bindings by filter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchletConfig {
    pub spec_sig: Signature,
    pub obj_sigs: Vec<Signature>,
    /// (filter name, blob signature, blob length)
    pub blobs: Vec<(String, Signature, usize)>,
}

impl SearchletConfig {
    fn path(dir: &Path, spec_sig: &Signature) -> PathBuf {
        dir.join(format!("{}.searchlet", spec_sig.to_filename()))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let mut out = format!("SPEC_SIG {}\n", self.spec_sig.to_filename());
        out.push_str(&format!("NUM_OBJECT_FILES {}\n", self.obj_sigs.len()));
        for sig in &self.obj_sigs {
            out.push_str(&format!("OBJECT_FILE {}\n", sig.to_filename()));
        }
        out.push_str(&format!("NUM_BLOBS {}\n", self.blobs.len()));
        for (name, sig, len) in &self.blobs {
            out.push_str(&format!("BLOBFILTER {name}\n"));
            out.push_str(&format!("BLOBSIG {}\n", sig.to_filename()));
            out.push_str(&format!("BLOBLEN {len}\n"));
        }

        std::fs::create_dir_all(dir)?;
        let path = Self::path(dir, &self.spec_sig);
        std::fs::write(&path, out).with_context(|| format!("writing {}", path.display()))
    }

    pub fn load(dir: &Path, spec_sig: &Signature) -> Result<Self> {
        let path = Self::path(dir, spec_sig);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;

        let mut config = SearchletConfig::default();
        let mut blob: Option<(String, Option<Signature>, Option<usize>)> = None;

        for line in text.lines() {
            let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
            match keyword {
                "SPEC_SIG" => {
                    config.spec_sig = Signature::from_hex(rest)
                        .with_context(|| format!("bad SPEC_SIG in {}", path.display()))?;
                }
                "NUM_OBJECT_FILES" | "NUM_BLOBS" => {}
                "OBJECT_FILE" => {
                    config.obj_sigs.push(
                        Signature::from_hex(rest)
                            .with_context(|| format!("bad OBJECT_FILE in {}", path.display()))?,
                    );
                }
                "BLOBFILTER" => {
                    flush_blob(&mut config, &mut blob)?;
                    blob = Some((rest.to_string(), None, None));
                }
                "BLOBSIG" => {
                    if let Some((_, sig, _)) = &mut blob {
                        *sig = Signature::from_hex(rest);
                    }
                }
                "BLOBLEN" => {
                    if let Some((_, _, len)) = &mut blob {
                        *len = rest.parse().ok();
                    }
                }
                _ => anyhow::bail!("unknown keyword in {}: {line:?}", path.display()),
            }
        }
        flush_blob(&mut config, &mut blob)?;
        Ok(config)
    }
}

fn flush_blob(
    config: &mut SearchletConfig,
    blob: &mut Option<(String, Option<Signature>, Option<usize>)>,
) -> Result<()> {
    if let Some((name, sig, len)) = blob.take() {
        let sig = sig.with_context(|| format!("blob for {name} missing BLOBSIG"))?;
        let len = len.with_context(|| format!("blob for {name} missing BLOBLEN"))?;
        config.blobs.push((name, sig, len));
    }
    Ok(())
}
