//! Per-session named accumulators for cross-server aggregation.
//!
//! A client periodically collects each server's local sums (`get`), merges
//! them across servers, and pushes the merged value back (`set`). Filter
//! writes that land while the client is mid-aggregation must not be folded
//! into the value the client already read, so between a `get` and the
//! matching `set` they accumulate in a separate slot.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default, Clone, Copy)]
struct SessionValue {
    local: f64,
    global: f64,
    between_get_and_set: f64,
}

#[derive(Default)]
struct SvState {
    store: HashMap<String, SessionValue>,
    between_get_and_set: bool,
}

#[derive(Default)]
pub struct SessionVariables {
    inner: Mutex<SvState>,
}

impl SessionVariables {
    pub fn new() -> Self {
        SessionVariables::default()
    }

    /// Snapshot `(name, local)` pairs and enter the between-get-and-set
    /// regime.
    pub fn get(&self) -> Vec<(String, f64)> {
        let mut state = self.inner.lock().unwrap();
        state.between_get_and_set = true;
        state
            .store
            .iter()
            .map(|(name, v)| (name.clone(), v.local))
            .collect()
    }

    /// Install the client's merged values and fold the mid-aggregation
    /// accumulator back into `local`.
    pub fn set(&self, pairs: &[(String, f64)]) {
        let mut state = self.inner.lock().unwrap();
        state.between_get_and_set = false;
        for (name, value) in pairs {
            let entry = state.store.entry(name.clone()).or_default();
            // the client's value already contains the local sum it fetched
            entry.global = *value;
            entry.local = entry.between_get_and_set;
            entry.between_get_and_set = 0.0;
        }
    }

    /// Filter-facing accumulation.
    pub fn add(&self, name: &str, delta: f64) {
        let mut state = self.inner.lock().unwrap();
        let between = state.between_get_and_set;
        let entry = state.store.entry(name.to_string()).or_default();
        if between {
            entry.between_get_and_set += delta;
        } else {
            entry.local += delta;
        }
    }

    /// Filter-facing read: the merged global plus anything accumulated
    /// locally since.
    pub fn value(&self, name: &str) -> f64 {
        let state = self.inner.lock().unwrap();
        state
            .store
            .get(name)
            .map(|v| v.global + v.local)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_get_set_cycle() {
        let vars = SessionVariables::new();
        vars.add("hits", 5.0);

        let snapshot = vars.get();
        assert_eq!(snapshot, vec![("hits".to_string(), 5.0)]);

        vars.set(&[("hits".to_string(), 12.0)]);
        // local folded into global, no mid-aggregation writes happened
        let snapshot = vars.get();
        assert_eq!(snapshot, vec![("hits".to_string(), 0.0)]);
        vars.set(&[("hits".to_string(), 12.0)]);
        assert_eq!(vars.value("hits"), 12.0);
    }

    #[test]
    fn writes_between_get_and_set_are_not_double_counted() {
        let vars = SessionVariables::new();
        vars.add("score", 1.0);

        let snapshot = vars.get();
        assert_eq!(snapshot[0].1, 1.0);

        // the client is aggregating; these must not vanish into the value
        // it already read
        vars.add("score", 2.0);
        vars.add("score", 3.0);

        vars.set(&[("score".to_string(), 10.0)]);
        assert_eq!(vars.value("score"), 15.0);

        let snapshot = vars.get();
        assert_eq!(snapshot[0].1, 5.0);
    }

    #[test]
    fn set_creates_missing_entries() {
        let vars = SessionVariables::new();
        vars.set(&[("fresh".to_string(), 7.0)]);
        assert_eq!(vars.value("fresh"), 7.0);
    }
}
