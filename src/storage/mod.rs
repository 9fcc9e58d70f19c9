// src/storage/mod.rs

//! Durable storage: checkpointed batches and discovered-user files.
//!
//! Every file is written atomically (temp file, then rename) so readers
//! and crashed writers never observe partial documents.

mod checkpoint;
mod registry;

pub use checkpoint::{BatchMeta, BatchRecord, Checkpoint, CheckpointStore};
pub use registry::UserRegistry;
