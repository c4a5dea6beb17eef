//! Objects moving through the evaluation pipeline.

use super::attr::AttributeStore;
use super::sig::Signature;

/// One object under evaluation. Owned by exactly one pipeline stage at a
/// time; stages hand it on by move.
pub struct ObjectData {
    /// Derived deterministically from the object's stable URI.
    pub id_sig: Signature,
    pub attrs: AttributeStore,
    /// Estimate of the evaluation work not yet performed for this object,
    /// as a fraction of the current pipeline. Carried on the transmit queue
    /// for backpressure accounting.
    pub remain_compute: f64,
}

impl ObjectData {
    pub fn new(uri: &str) -> Self {
        ObjectData {
            id_sig: Signature::hash_str(uri),
            attrs: AttributeStore::new(),
            remain_compute: 1.0,
        }
    }
}

/// Element of the transmit queue. `End` tells the client the search scope
/// has drained; it carries no data and no remaining compute.
pub enum TransmitItem {
    Object { obj: ObjectData, complete: bool },
    End,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_sig_is_uri_hash() {
        let obj = ObjectData::new("obj/a");
        assert_eq!(obj.id_sig, Signature::hash_str("obj/a"));
        assert_eq!(obj.remain_compute, 1.0);
    }
}
