//! Per-object attribute store.
//!
//! An insertion-ordered mapping from attribute name to value bytes plus a
//! content signature computed at write time. Writers replace bytes and
//! signature together; omitted attributes survive locally but are excluded
//! from iteration and never cross the wire. An optional listener observes
//! every successful read and write, which is how the result cache learns
//! which attributes a filter consumed and produced.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::error::EngineError;
use super::sig::Signature;

/// Unnamed attribute carrying the raw object data.
pub const OBJ_DATA: &str = "";
pub const OBJ_ID: &str = "_ObjectID";
pub const OBJ_URI: &str = "_ObjectURI";
pub const DISPLAY_NAME: &str = "Display-Name";
pub const DEVICE_NAME: &str = "Device-Name";
pub const FILTER_TOTAL_TIME: &str = "_filter.total_time_ns";

pub const MAX_ATTR_NAME: usize = 128;

/// Values larger than this are elided when an object crosses the wire.
pub const BIG_THRESH: usize = 1000;

pub fn filter_score_attr(filter: &str) -> String {
    format!("_filter.{filter}_score")
}

pub fn filter_time_attr(filter: &str) -> String {
    format!("_filter.{filter}_time_ns")
}

pub fn filter_error_attr(filter: &str) -> String {
    format!("_filter.{filter}_error")
}

/// Observer for attribute traffic. Fired exactly once per successful read or
/// write, with the value signature current at that moment.
pub trait AttrListener: Send + Sync {
    fn on_read(&self, name: &str, value: &[u8], sig: &Signature);
    fn on_write(&self, name: &str, value: &[u8], sig: &Signature);
}

#[derive(Clone, Serialize, Deserialize)]
struct AttrRecord {
    name: String,
    value: Vec<u8>,
    sig: Signature,
    omit: bool,
    free: bool,
}

#[derive(Default)]
pub struct AttributeStore {
    records: Vec<AttrRecord>,
    index: HashMap<String, usize>,
    listener: Option<Arc<dyn AttrListener>>,
}

impl AttributeStore {
    pub fn new() -> Self {
        AttributeStore::default()
    }

    pub fn set_listener(&mut self, listener: Arc<dyn AttrListener>) {
        self.listener = Some(listener);
    }

    pub fn clear_listener(&mut self) {
        self.listener = None;
    }

    fn check_name(name: &str) -> Result<(), EngineError> {
        if name.len() > MAX_ATTR_NAME {
            return Err(EngineError::InvalidInput(format!(
                "attribute name longer than {MAX_ATTR_NAME} bytes"
            )));
        }
        if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
            return Err(EngineError::InvalidInput(
                "attribute name must be printable ASCII".to_string(),
            ));
        }
        Ok(())
    }

    /// Upsert: replaces value bytes and digest together and clears the omit
    /// flag.
    pub fn write(&mut self, name: &str, value: &[u8]) -> Result<(), EngineError> {
        Self::check_name(name)?;
        let sig = Signature::hash_bytes(value);

        match self.index.get(name) {
            Some(&i) => {
                let rec = &mut self.records[i];
                rec.value = value.to_vec();
                rec.sig = sig;
                rec.omit = false;
                rec.free = false;
            }
            None => {
                let i = self.records.len();
                self.records.push(AttrRecord {
                    name: name.to_string(),
                    value: value.to_vec(),
                    sig,
                    omit: false,
                    free: false,
                });
                self.index.insert(name.to_string(), i);
            }
        }

        if let Some(listener) = &self.listener {
            listener.on_write(name, value, &sig);
        }
        Ok(())
    }

    /// Write only if the name is absent, without firing the listener. Used
    /// for system-default attributes on freshly fetched objects.
    pub fn write_if_absent(&mut self, name: &str, value: &[u8]) -> Result<(), EngineError> {
        if self.live(name).is_some() {
            return Ok(());
        }
        let listener = self.listener.take();
        let out = self.write(name, value);
        self.listener = listener;
        out
    }

    fn live(&self, name: &str) -> Option<&AttrRecord> {
        self.index
            .get(name)
            .map(|&i| &self.records[i])
            .filter(|r| !r.free)
    }

    /// Copy-out read.
    pub fn read(&self, name: &str) -> Option<Vec<u8>> {
        self.ref_attr(name).map(|v| v.to_vec())
    }

    /// Borrowing read, valid until the next mutation of this attribute.
    pub fn ref_attr(&self, name: &str) -> Option<&[u8]> {
        let rec = self.live(name)?;
        if let Some(listener) = &self.listener {
            listener.on_read(&rec.name, &rec.value, &rec.sig);
        }
        Some(&rec.value)
    }

    /// Read without firing the listener. Internal plumbing (cache value
    /// persistence, transmit serialization) uses this so bookkeeping reads
    /// are not mistaken for filter input.
    pub(crate) fn peek(&self, name: &str) -> Option<&[u8]> {
        self.live(name).map(|r| r.value.as_slice())
    }

    pub fn sig_of(&self, name: &str) -> Option<Signature> {
        self.live(name).map(|r| r.sig)
    }

    /// Exclude the attribute from network emission.
    pub fn omit(&mut self, name: &str) -> Result<(), EngineError> {
        match self.index.get(name) {
            Some(&i) if !self.records[i].free => {
                self.records[i].omit = true;
                Ok(())
            }
            _ => Err(EngineError::NotFound),
        }
    }

    pub fn delete(&mut self, name: &str) -> Result<(), EngineError> {
        match self.index.remove(name) {
            Some(i) => {
                let rec = &mut self.records[i];
                rec.free = true;
                rec.value = Vec::new();
                Ok(())
            }
            None => Err(EngineError::NotFound),
        }
    }

    /// Iterate all non-free, non-omitted entries in insertion order. With
    /// `skip_large`, entries whose value exceeds [`BIG_THRESH`] are elided.
    pub fn iter(&self, skip_large: bool) -> impl Iterator<Item = (&str, &[u8], &Signature)> {
        self.records
            .iter()
            .filter(move |r| !r.free && !r.omit && !(skip_large && r.value.len() > BIG_THRESH))
            .map(|r| (r.name.as_str(), r.value.as_slice(), &r.sig))
    }

    pub fn len(&self) -> usize {
        self.iter(false).count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter(false).next().is_none()
    }

    /// Persist the live attributes. The layout is private to this engine.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let live: Vec<&AttrRecord> = self.records.iter().filter(|r| !r.free).collect();
        bincode::serialize(&live).context("failed to serialize attribute store")
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let records: Vec<AttrRecord> =
            bincode::deserialize(data).context("failed to deserialize attribute store")?;
        let mut index = HashMap::new();
        for (i, rec) in records.iter().enumerate() {
            index.insert(rec.name.clone(), i);
        }
        Ok(AttributeStore {
            records,
            index,
            listener: None,
        })
    }
}
