//! Engine configuration.
//!
//! One `EngineConfig` per client connection, captured at session spawn. The
//! bypass tuning knobs live in `PolicyConfig` rather than process globals so
//! concurrent sessions can run different policies.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How bypass thresholds are distributed over the filter pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BypassPolicy {
    /// Run every filter at the storage node.
    None,
    /// Split only the first filter in the permutation.
    Simple,
    #[default]
    Greedy,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub bypass: BypassPolicy,
    /// Fraction of the average pipeline cost to spend locally, in [0, 1].
    pub split_ratio: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            bypass: BypassPolicy::default(),
            split_ratio: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URI of the data-retriever collection endpoint.
    pub retriever_base: String,
    /// Directory holding ocache.db/oattr.db plus the spec and blob stores.
    pub cache_dir: PathBuf,
    /// Value for the Device-Name attribute on fetched objects.
    pub device_name: String,
    /// Maximum objects in flight to the client before the worker stalls.
    pub pend_max: u32,
    /// Keep evaluating (and discarding) objects while stalled to warm the
    /// cache.
    pub work_ahead: bool,
    pub policy: PolicyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            retriever_base: "http://localhost:5873/collection/".to_string(),
            cache_dir: PathBuf::from("/tmp/siftd_cache"),
            device_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            pend_max: 30,
            work_ahead: false,
            policy: PolicyConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Default configuration with environment overrides
    /// (`SIFTD_RETRIEVER_BASE`, `SIFTD_CACHE_DIR`).
    pub fn from_env() -> Self {
        let mut config = EngineConfig::default();
        if let Ok(base) = std::env::var("SIFTD_RETRIEVER_BASE") {
            config.retriever_base = base;
        }
        if let Ok(dir) = std::env::var("SIFTD_CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.pend_max, 30);
        assert!(!config.work_ahead);
        assert_eq!(config.policy.bypass, BypassPolicy::Greedy);
        assert_eq!(config.policy.split_ratio, 1.0);
    }
}
