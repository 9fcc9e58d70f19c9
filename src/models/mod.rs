// src/models/mod.rs

//! Data structures shared across the collection engine.

mod config;
mod plan;
mod post;
mod window;

pub use config::{
    AccountConfig, CollectorConfig, Config, CustomWindow, PartitionConfig, PathsConfig,
};
pub use plan::{
    CollectionPlan, CollectionTarget, Credential, SearchFilters, UserShare, WorkerAssignment,
    WorkerScope,
};
pub use post::{DiscoveredUser, InteractionEdge, InteractionKind, Post, QuotedPost};
pub use window::{PartitionStrategy, TimeWindow};
