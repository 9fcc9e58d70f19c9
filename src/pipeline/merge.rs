// src/pipeline/merge.rs

//! Deduplicating merge of batches into worker results and worker results
//! into the final document.
//!
//! Posts are deduplicated by uri with a richer-wins rule: a copy with an
//! expanded reply/quote tree is never replaced by a flat copy, and among
//! equally deep copies the most recently fetched one wins. First-seen
//! order is preserved so merging is deterministic.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{CollectionPlan, CollectionTarget, DiscoveredUser, Post, TimeWindow};
use crate::storage::CheckpointStore;

/// One worker's merged output document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub worker_id: usize,
    pub window: TimeWindow,
    pub posts: Vec<Post>,
    pub participants: Vec<DiscoveredUser>,
}

/// Run-level metadata recorded in the final document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Keyword or handle the run targeted.
    pub target: String,
    pub total_results: usize,
    pub recursion_strategy: String,
    pub collected_at: DateTime<Utc>,
    pub workers_used: usize,
    pub successful_workers: usize,
    pub partition_strategy: String,
    pub time_windows: Vec<TimeWindow>,
}

/// The job-level output document. Keyword runs carry `search_metadata`,
/// user-feed and batch runs the equivalent `user_metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_metadata: Option<RunMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_metadata: Option<RunMetadata>,
    pub posts: Vec<Post>,
    pub topic_participants: Vec<DiscoveredUser>,
}

impl FinalResult {
    pub fn metadata(&self) -> Option<&RunMetadata> {
        self.search_metadata.as_ref().or(self.user_metadata.as_ref())
    }
}

/// Deduplicate posts by uri, richer-wins, preserving first-seen order.
pub fn dedup_posts(posts: impl IntoIterator<Item = Post>) -> Vec<Post> {
    let mut order: Vec<String> = Vec::new();
    let mut by_uri: HashMap<String, Post> = HashMap::new();
    for post in posts {
        match by_uri.entry(post.uri.clone()) {
            Entry::Vacant(slot) => {
                order.push(post.uri.clone());
                slot.insert(post);
            }
            Entry::Occupied(mut slot) => {
                // Later copy wins unless the stored one has the deeper tree.
                if !slot.get().is_richer_than(&post) {
                    slot.insert(post);
                }
            }
        }
    }
    order.into_iter().filter_map(|uri| by_uri.remove(&uri)).collect()
}

/// Union participants by did, backfilling display names.
pub fn dedup_users(users: impl IntoIterator<Item = DiscoveredUser>) -> Vec<DiscoveredUser> {
    let mut order: Vec<String> = Vec::new();
    let mut by_did: HashMap<String, DiscoveredUser> = HashMap::new();
    for user in users {
        match by_did.entry(user.did.clone()) {
            Entry::Vacant(slot) => {
                order.push(user.did.clone());
                slot.insert(user);
            }
            Entry::Occupied(mut slot) => slot.get_mut().absorb(&user),
        }
    }
    order.into_iter().filter_map(|did| by_did.remove(&did)).collect()
}

/// Fold a worker's checkpointed batches into its result document, write
/// it, then delete the batch and checkpoint files.
pub async fn merge_worker(
    store: &CheckpointStore,
    worker_id: usize,
    window: &TimeWindow,
) -> Result<WorkerResult> {
    let mut posts: Vec<Post> = Vec::new();
    let mut participants: Vec<DiscoveredUser> = Vec::new();
    for batch_number in store.list_batches(worker_id).await? {
        let batch = store.read_batch(worker_id, batch_number).await?;
        posts.extend(batch.posts);
        participants.extend(batch.participants);
    }

    let result = WorkerResult {
        worker_id,
        window: window.clone(),
        posts: dedup_posts(posts),
        participants: dedup_users(participants),
    };
    let path = store.write_worker_result(worker_id, &result).await?;
    store.remove_worker_intermediates(worker_id).await?;
    log::info!(
        "worker {worker_id}: merged {} posts into {}",
        result.posts.len(),
        path.display()
    );
    Ok(result)
}

/// Merge all successful worker results into the final document and write
/// it. Overlap seams collapse here because dedup is by uri.
pub async fn merge_final(
    store: &CheckpointStore,
    plan: &CollectionPlan,
    results: Vec<WorkerResult>,
) -> Result<FinalResult> {
    let successful_workers = results.len();
    let mut posts: Vec<Post> = Vec::new();
    let mut participants: Vec<DiscoveredUser> = Vec::new();
    for result in results {
        posts.extend(result.posts);
        participants.extend(result.participants);
    }
    let posts = dedup_posts(posts);
    let participants = dedup_users(participants);

    let metadata = RunMetadata {
        target: match &plan.target {
            CollectionTarget::Keyword { keyword, .. } => keyword.clone(),
            CollectionTarget::User { handle } => handle.clone(),
            CollectionTarget::UserBatch { label } => label.clone(),
        },
        total_results: posts.len(),
        recursion_strategy: "original_only".to_string(),
        collected_at: Utc::now(),
        workers_used: plan.credentials.len(),
        successful_workers,
        partition_strategy: plan.strategy.as_str().to_string(),
        time_windows: plan.windows(),
    };
    let is_search = matches!(plan.target, CollectionTarget::Keyword { .. });
    let result = FinalResult {
        search_metadata: is_search.then(|| metadata.clone()),
        user_metadata: (!is_search).then_some(metadata),
        posts,
        topic_participants: participants,
    };

    let path = store.write_final_result(&result).await?;
    log::info!(
        "final merge: {} posts, {} participants -> {}",
        result.posts.len(),
        result.topic_participants.len(),
        path.display()
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testutil::flat_post;
    use crate::storage::BatchRecord;
    use tempfile::TempDir;

    #[test]
    fn later_copy_wins_unless_existing_is_richer() {
        let mut deep = flat_post("at://a/1");
        deep.replies.push(flat_post("at://b/2"));
        let mut flat = flat_post("at://a/1");
        flat.text = "updated".to_string();

        // Deep first: flat copy cannot displace it.
        let merged = dedup_posts(vec![deep.clone(), flat.clone()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].replies.len(), 1);

        // Flat first: deep copy replaces it.
        let merged = dedup_posts(vec![flat.clone(), deep]);
        assert_eq!(merged[0].replies.len(), 1);

        // Two flat copies: the later fetch wins.
        let merged = dedup_posts(vec![flat_post("at://a/1"), flat]);
        assert_eq!(merged[0].text, "updated");
    }

    #[test]
    fn dedup_preserves_first_seen_order() {
        let merged = dedup_posts(vec![
            flat_post("at://a/1"),
            flat_post("at://a/2"),
            flat_post("at://a/1"),
            flat_post("at://a/3"),
        ]);
        let uris: Vec<&str> = merged.iter().map(|p| p.uri.as_str()).collect();
        assert_eq!(uris, vec!["at://a/1", "at://a/2", "at://a/3"]);
    }

    #[test]
    fn dedup_users_backfills_names() {
        let anon = DiscoveredUser {
            did: "did:plc:a".to_string(),
            handle: "a.test".to_string(),
            display_name: None,
        };
        let named = DiscoveredUser {
            display_name: Some("A".to_string()),
            ..anon.clone()
        };
        let merged = dedup_users(vec![anon, named]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].display_name.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn merge_worker_folds_batches_and_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path(), "job");
        let window = TimeWindow::new(Utc::now(), Utc::now() + chrono::Duration::days(1), 0);

        store
            .write_batch(&BatchRecord::new(
                0,
                1,
                Some("c1".to_string()),
                vec![flat_post("at://a/1"), flat_post("at://a/2")],
                Vec::new(),
            ))
            .await
            .unwrap();
        store
            .write_batch(&BatchRecord::new(
                0,
                2,
                None,
                vec![flat_post("at://a/2"), flat_post("at://a/3")],
                Vec::new(),
            ))
            .await
            .unwrap();

        let result = merge_worker(&store, 0, &window).await.unwrap();
        assert_eq!(result.posts.len(), 3);

        // Intermediates are gone, the result document survives.
        assert!(store.read_checkpoint(0).await.unwrap().is_none());
        let reread: WorkerResult = store.read_worker_result(0).await.unwrap().unwrap();
        assert_eq!(reread.posts.len(), 3);

        // Merging the already-merged result again changes nothing.
        let again = dedup_posts(reread.posts.clone());
        assert_eq!(again.len(), 3);
    }
}
