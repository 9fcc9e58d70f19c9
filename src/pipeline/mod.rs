// src/pipeline/mod.rs

//! The collection pipeline: work partitioning, per-worker collection,
//! deduplicating merge, and run orchestration.

mod merge;
mod orchestrate;
mod partition;
mod worker;

pub use merge::{FinalResult, RunMetadata, WorkerResult, dedup_posts, dedup_users};
pub use orchestrate::{Orchestrator, RunReport};
pub use partition::{partition_users, partition_windows};
pub use worker::CollectionWorker;
