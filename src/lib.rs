//! siftd - storage-node engine for distributed interactive search
//!
//! This crate implements the per-server search engine core: it applies an
//! installed filter pipeline to every object in a declared scope and streams
//! surviving objects back, with persistent caching of past evaluations,
//! adaptive filter ordering, and partial-evaluation offload to the client.

pub mod engine;

// Re-export the types a transport layer needs
pub use engine::object::{ObjectData, TransmitItem};
pub use engine::search::{SearchHandle, SearchSession};
pub use engine::sig::Signature;
