//! Dynamic control tree: runtime-readable (and selectively writable)
//! counters and tuning knobs, addressed by slash-separated paths.
//!
//! Each search session registers its counters and knobs here so a transport
//! can inspect and tune a running search (`search/pend_maximum`,
//! `search/work_ahead`, ...) without a dedicated RPC per knob.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::error::EngineError;

#[derive(Clone)]
enum Leaf {
    U32 { value: Arc<AtomicU32>, writable: bool },
    I64 { value: Arc<AtomicI64>, writable: bool },
    Bool { value: Arc<AtomicBool>, writable: bool },
}

impl Leaf {
    fn read(&self) -> String {
        match self {
            Leaf::U32 { value, .. } => value.load(Ordering::Relaxed).to_string(),
            Leaf::I64 { value, .. } => value.load(Ordering::Relaxed).to_string(),
            Leaf::Bool { value, .. } => value.load(Ordering::Relaxed).to_string(),
        }
    }

    fn write(&self, input: &str) -> Result<(), EngineError> {
        let bad = || EngineError::InvalidInput(format!("bad control value {input:?}"));
        match self {
            Leaf::U32 { value, writable: true } => {
                value.store(input.parse().map_err(|_| bad())?, Ordering::Relaxed);
                Ok(())
            }
            Leaf::I64 { value, writable: true } => {
                value.store(input.parse().map_err(|_| bad())?, Ordering::Relaxed);
                Ok(())
            }
            Leaf::Bool { value, writable: true } => {
                value.store(input.parse().map_err(|_| bad())?, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(EngineError::InvalidInput("control leaf is read-only".to_string())),
        }
    }
}

#[derive(Default)]
pub struct ControlTree {
    leaves: Mutex<BTreeMap<String, Leaf>>,
}

impl ControlTree {
    pub fn new() -> Self {
        ControlTree::default()
    }

    pub fn register_u32(&self, path: &str, value: Arc<AtomicU32>, writable: bool) {
        self.leaves
            .lock()
            .unwrap()
            .insert(path.to_string(), Leaf::U32 { value, writable });
    }

    pub fn register_i64(&self, path: &str, value: Arc<AtomicI64>, writable: bool) {
        self.leaves
            .lock()
            .unwrap()
            .insert(path.to_string(), Leaf::I64 { value, writable });
    }

    pub fn register_bool(&self, path: &str, value: Arc<AtomicBool>, writable: bool) {
        self.leaves
            .lock()
            .unwrap()
            .insert(path.to_string(), Leaf::Bool { value, writable });
    }

    pub fn read_leaf(&self, path: &str) -> Result<String, EngineError> {
        self.leaves
            .lock()
            .unwrap()
            .get(path)
            .map(Leaf::read)
            .ok_or(EngineError::NotFound)
    }

    pub fn write_leaf(&self, path: &str, value: &str) -> Result<(), EngineError> {
        let leaves = self.leaves.lock().unwrap();
        leaves.get(path).ok_or(EngineError::NotFound)?.write(value)
    }

    /// Leaf paths under a node, e.g. `list("search")`.
    pub fn list_leafs(&self, node: &str) -> Vec<String> {
        let prefix = if node.is_empty() {
            String::new()
        } else {
            format!("{node}/")
        };
        self.leaves
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect()
    }
}
