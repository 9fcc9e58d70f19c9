// src/models/plan.rs

//! Collection plans and worker assignments.
//!
//! The CLI/config layer resolves user input into a [`CollectionPlan`];
//! the orchestrator turns it into one immutable [`WorkerAssignment`] per
//! credential.

use serde::{Deserialize, Serialize};

use crate::models::{PartitionStrategy, TimeWindow};

/// One account's credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    /// Tried when the main password is rejected.
    #[serde(default)]
    pub app_password: Option<String>,
}

/// Optional filters for keyword search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub mentions: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sort: Option<String>,
}

/// What the run collects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CollectionTarget {
    /// Keyword search across the network.
    Keyword {
        keyword: String,
        #[serde(default)]
        filters: SearchFilters,
    },
    /// One user's feed.
    User { handle: String },
    /// The feeds of a previously discovered user list, split across
    /// workers as [`UserShare`]s.
    UserBatch { label: String },
}

impl CollectionTarget {
    /// Topic name for topic-scoped discovered-user files. Only keyword
    /// runs have one.
    pub fn topic(&self) -> Option<&str> {
        match self {
            CollectionTarget::Keyword { keyword, .. } => Some(keyword),
            CollectionTarget::User { .. } | CollectionTarget::UserBatch { .. } => None,
        }
    }

    /// Filesystem-safe job name encoding the target and date range.
    pub fn job_name(&self, windows: &[TimeWindow]) -> String {
        let range = match (windows.first(), windows.last()) {
            (Some(first), Some(last)) => format!(
                "_{}_to_{}",
                first.start.format("%Y-%m-%d"),
                last.end.format("%Y-%m-%d")
            ),
            _ => String::new(),
        };
        match self {
            CollectionTarget::Keyword { keyword, .. } => {
                format!("search_{}{range}", sanitize(keyword))
            }
            CollectionTarget::User { handle } => format!("{}_posts{range}", sanitize(handle)),
            CollectionTarget::UserBatch { label } => format!("batch_{}{range}", sanitize(label)),
        }
    }
}

fn sanitize(s: &str) -> String {
    s.replace([' ', '.'], "_")
}

/// One worker's share of a user-batch run: the handles it walks plus the
/// window its posts are filtered to.
#[derive(Debug, Clone)]
pub struct UserShare {
    pub handles: Vec<String>,
    pub window: TimeWindow,
}

/// The slice of the target one worker owns: a time window of the whole
/// target, or a share of a discovered-user list.
#[derive(Debug, Clone)]
pub enum WorkerScope {
    Window(TimeWindow),
    UserShare(UserShare),
}

impl WorkerScope {
    /// Every scope carries a window; user shares filter against theirs
    /// client-side.
    pub fn window(&self) -> &TimeWindow {
        match self {
            WorkerScope::Window(window) => window,
            WorkerScope::UserShare(share) => &share.window,
        }
    }
}

/// A fully-resolved collection run.
#[derive(Debug, Clone)]
pub struct CollectionPlan {
    pub target: CollectionTarget,
    /// One scope per credential, in worker order.
    pub scopes: Vec<WorkerScope>,
    pub credentials: Vec<Credential>,
    /// Total item limit across all workers; 0 means unlimited.
    pub limit: u64,
    pub strategy: PartitionStrategy,
}

impl CollectionPlan {
    /// Per-worker share of the total limit. Unlimited stays unlimited for
    /// every worker rather than becoming a fractional share.
    pub fn worker_limit(&self) -> u64 {
        if self.limit == 0 {
            0
        } else {
            self.limit / self.credentials.len().max(1) as u64
        }
    }

    /// The window list, one per scope, for job naming and run metadata.
    pub fn windows(&self) -> Vec<TimeWindow> {
        self.scopes.iter().map(|s| s.window().clone()).collect()
    }
}

/// Everything one worker needs, fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct WorkerAssignment {
    pub credential: Credential,
    pub scope: WorkerScope,
    /// 0 means unlimited.
    pub limit: u64,
}
