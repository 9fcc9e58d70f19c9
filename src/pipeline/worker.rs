// src/pipeline/worker.rs

//! One collection worker: a credential bound to a scope, either a time
//! window of the whole target or a share of a discovered-user list.
//!
//! The worker pages through its scope, enriches every new post, and
//! persists progress as numbered batches. Batches are flushed only at
//! page boundaries so the stored cursor is always valid for the whole
//! batch. On restart the worker rebuilds its emitted-uri set from its
//! own batches and resumes from the checkpointed cursor, so nothing is
//! refetched and nothing is emitted twice.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::models::{
    CollectionTarget, CollectorConfig, DiscoveredUser, Post, UserShare, WorkerAssignment,
    WorkerScope,
};
use crate::pipeline::merge::{self, WorkerResult};
use crate::services::{ApiClient, Page, RecursiveFetcher};
use crate::storage::{BatchRecord, CheckpointStore, UserRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Init,
    Fetching,
    Checkpointing,
    MergingLocal,
    Done,
    Failed,
}

pub struct CollectionWorker {
    id: usize,
    assignment: WorkerAssignment,
    target: CollectionTarget,
    api: Arc<dyn ApiClient>,
    fetcher: RecursiveFetcher,
    store: Arc<CheckpointStore>,
    batch_size: usize,
    cancel: Arc<AtomicBool>,
    state: WorkerState,
}

impl CollectionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        assignment: WorkerAssignment,
        target: CollectionTarget,
        api: Arc<dyn ApiClient>,
        registry: Arc<UserRegistry>,
        store: Arc<CheckpointStore>,
        collector: &CollectorConfig,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let fetcher = RecursiveFetcher::new(
            Arc::clone(&api),
            registry,
            target.topic().map(str::to_string),
            Duration::from_millis(collector.rate_limit_delay_ms),
        );
        Self {
            id,
            assignment,
            target,
            api,
            fetcher,
            store,
            batch_size: collector.batch_size,
            cancel,
            state: WorkerState::Init,
        }
    }

    pub async fn run(mut self) -> Result<WorkerResult> {
        match self.collect().await {
            Ok(result) => {
                self.set_state(WorkerState::Done);
                Ok(result)
            }
            Err(e) => {
                self.set_state(WorkerState::Failed);
                log::error!("worker {}: {e}", self.id);
                Err(e)
            }
        }
    }

    async fn collect(&mut self) -> Result<WorkerResult> {
        // A result document means a previous run finished this worker.
        if let Some(result) = self.store.read_worker_result::<WorkerResult>(self.id).await? {
            log::info!(
                "worker {}: already complete ({} posts), skipping",
                self.id,
                result.posts.len()
            );
            return Ok(result);
        }

        self.api.authenticate(&self.assignment.credential).await?;
        let window = self.assignment.scope.window().clone();
        log::info!(
            "worker {}: {} over [{} .. {})",
            self.id,
            self.assignment.credential.username,
            window.since_param(),
            window.until_param()
        );

        // Resume state: checkpointed cursor plus the uris already emitted.
        let checkpoint = self.store.read_checkpoint(self.id).await?;
        let mut seen: HashSet<String> = HashSet::new();
        for batch_number in self.store.list_batches(self.id).await? {
            let batch = self.store.read_batch(self.id, batch_number).await?;
            seen.extend(batch.posts.into_iter().map(|p| p.uri));
        }
        let (mut next_batch, mut cursor, mut emitted) = match &checkpoint {
            Some(c) => (c.last_batch + 1, c.cursor.clone(), c.items_total),
            None => (1, None, 0),
        };
        // A checkpoint without a cursor means fetching already finished.
        let mut exhausted = checkpoint.is_some() && cursor.is_none();
        if !seen.is_empty() {
            log::info!(
                "worker {}: resuming after batch {} with {} posts emitted",
                self.id,
                next_batch - 1,
                emitted
            );
        }

        let limit = self.assignment.limit;
        self.set_state(WorkerState::Fetching);
        while !exhausted {
            if self.cancel.load(Ordering::Relaxed) {
                log::warn!("worker {}: cancelled at batch boundary", self.id);
                return Err(AppError::Cancelled);
            }
            if limit > 0 && emitted >= limit {
                break;
            }

            // Which feed a share cursor points at, fixed before the fetch
            // so an exhausted feed advances from the right position.
            let share_index = match &self.assignment.scope {
                WorkerScope::UserShare(_) => Some(parse_share_cursor(cursor.as_deref())?.0),
                WorkerScope::Window(_) => None,
            };
            let page = self.fetch_page(cursor.as_deref()).await?;
            let page_len = page.items.len();
            let page_cursor = page.cursor.clone();

            let (fresh, participants, past_window) =
                self.enrich_page(page, &mut seen, limit, emitted).await?;

            // Flush at the page boundary. fetch_page never asks for more
            // than batch_size items, so one page is one batch and the page
            // cursor is a valid resume point for all of it.
            if !fresh.is_empty() {
                self.set_state(WorkerState::Checkpointing);
                emitted += fresh.len() as u64;
                let record = BatchRecord::new(
                    self.id,
                    next_batch,
                    page_cursor.clone(),
                    fresh,
                    participants,
                );
                self.store.write_batch(&record).await?;
                next_batch += 1;
                self.set_state(WorkerState::Fetching);
            }

            cursor = page_cursor;
            match (&self.assignment.scope, share_index) {
                (WorkerScope::UserShare(share), Some(index))
                    if past_window || page_len == 0 =>
                {
                    // This feed is drained (or has aged out of the
                    // window); move to the next one in the share.
                    cursor = next_share_cursor(share, index);
                    exhausted = cursor.is_none() || (limit > 0 && emitted >= limit);
                }
                (WorkerScope::UserShare(_), _) => {
                    exhausted = cursor.is_none() || (limit > 0 && emitted >= limit);
                }
                (WorkerScope::Window(_), _) => {
                    exhausted = cursor.is_none()
                        || page_len == 0
                        || past_window
                        || (limit > 0 && emitted >= limit);
                }
            }
        }

        self.set_state(WorkerState::MergingLocal);
        merge::merge_worker(&self.store, self.id, &window).await
    }

    /// Filter one page down to new in-window posts and enrich them.
    /// Returns the enriched posts, the users discovered while enriching,
    /// and whether the feed has moved past the window's start.
    async fn enrich_page(
        &self,
        page: Page<Post>,
        seen: &mut HashSet<String>,
        limit: u64,
        emitted: u64,
    ) -> Result<(Vec<Post>, Vec<DiscoveredUser>, bool)> {
        // Author feeds have no server-side time filters.
        let filter_window = matches!(self.target, CollectionTarget::User { .. })
            || matches!(self.assignment.scope, WorkerScope::UserShare(_));
        let window = self.assignment.scope.window();
        let mut fresh = Vec::new();
        let mut participants = Vec::new();
        let mut past_window = false;

        for mut post in page.items {
            if limit > 0 && emitted + fresh.len() as u64 >= limit {
                break;
            }
            if filter_window {
                match parse_created_at(&post) {
                    Some(ts) if ts < window.start => {
                        // Author feeds are reverse-chronological; everything
                        // from here on predates the window.
                        past_window = true;
                        continue;
                    }
                    Some(ts) if !window.contains(ts) => continue,
                    _ => {}
                }
            }
            if !seen.insert(post.uri.clone()) {
                continue;
            }
            let users = self.fetcher.enrich(&mut post).await?;
            participants.extend(users);
            fresh.push(post);
        }
        Ok((fresh, participants, past_window))
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<Page<Post>> {
        if let WorkerScope::UserShare(share) = &self.assignment.scope {
            return self.fetch_share_page(share, cursor).await;
        }
        match &self.target {
            CollectionTarget::Keyword { keyword, filters } => {
                self.api
                    .search_posts(
                        keyword,
                        filters,
                        self.assignment.scope.window(),
                        self.batch_size,
                        cursor,
                    )
                    .await
            }
            CollectionTarget::User { handle } => {
                self.api.user_posts(handle, self.batch_size, cursor).await
            }
            CollectionTarget::UserBatch { .. } => Err(AppError::config(
                "user batch runs need user-share assignments",
            )),
        }
    }

    /// Walk the share's feeds in listed order. The composite cursor is
    /// `<feed index>|<feed cursor>`; a feed whose own cursor runs out
    /// hands over to the next feed in the share.
    async fn fetch_share_page(&self, share: &UserShare, cursor: Option<&str>) -> Result<Page<Post>> {
        let (index, feed_cursor) = parse_share_cursor(cursor)?;
        let Some(handle) = share.handles.get(index) else {
            return Ok(Page::empty());
        };
        let page = self
            .api
            .user_posts(handle, self.batch_size, feed_cursor.as_deref())
            .await?;
        Ok(Page {
            cursor: match page.cursor {
                Some(c) => Some(format!("{index}|{c}")),
                None => next_share_cursor(share, index),
            },
            items: page.items,
        })
    }

    fn set_state(&mut self, next: WorkerState) {
        if self.state != next {
            log::debug!("worker {}: {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
        }
    }
}

fn parse_share_cursor(cursor: Option<&str>) -> Result<(usize, Option<String>)> {
    let Some(cursor) = cursor else {
        return Ok((0, None));
    };
    let (index, rest) = cursor
        .split_once('|')
        .ok_or_else(|| AppError::storage(format!("malformed share cursor: {cursor:?}")))?;
    let index = index
        .parse()
        .map_err(|_| AppError::storage(format!("malformed share cursor: {cursor:?}")))?;
    let feed_cursor = (!rest.is_empty()).then(|| rest.to_string());
    Ok((index, feed_cursor))
}

fn next_share_cursor(share: &UserShare, index: usize) -> Option<String> {
    (index + 1 < share.handles.len()).then(|| format!("{}|", index + 1))
}

fn parse_created_at(post: &Post) -> Option<DateTime<Utc>> {
    post.created_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testutil::{flat_post, like_edge};
    use crate::models::{Credential, SearchFilters, TimeWindow};
    use crate::services::mock::MockApi;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn window() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 11, 0, 0, 0).unwrap(),
            0,
        )
    }

    fn assignment(scope: WorkerScope, limit: u64) -> WorkerAssignment {
        WorkerAssignment {
            credential: Credential {
                username: "u.test".to_string(),
                password: "pw".to_string(),
                app_password: None,
            },
            scope,
            limit,
        }
    }

    fn keyword_target() -> CollectionTarget {
        CollectionTarget::Keyword {
            keyword: "rust".to_string(),
            filters: SearchFilters::default(),
        }
    }

    fn worker(
        api: Arc<MockApi>,
        store: Arc<CheckpointStore>,
        tmp: &TempDir,
        target: CollectionTarget,
        scope: WorkerScope,
        limit: u64,
    ) -> CollectionWorker {
        let collector = CollectorConfig {
            batch_size: 2,
            rate_limit_delay_ms: 0,
            ..CollectorConfig::default()
        };
        CollectionWorker::new(
            0,
            assignment(scope, limit),
            target,
            api,
            Arc::new(UserRegistry::new(tmp.path().join("users"))),
            store,
            &collector,
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn windowed_worker(
        api: Arc<MockApi>,
        store: Arc<CheckpointStore>,
        tmp: &TempDir,
        target: CollectionTarget,
        limit: u64,
    ) -> CollectionWorker {
        worker(api, store, tmp, target, WorkerScope::Window(window()), limit)
    }

    fn share_of(handles: &[&str]) -> WorkerScope {
        WorkerScope::UserShare(UserShare {
            handles: handles.iter().map(|h| h.to_string()).collect(),
            window: window(),
        })
    }

    fn scripted_posts(n: usize) -> Vec<Post> {
        (0..n).map(|i| flat_post(&format!("at://a/{i}"))).collect()
    }

    fn in_window_post(uri: &str) -> Post {
        let mut post = flat_post(uri);
        post.created_at = Some("2024-01-05T00:00:00Z".to_string());
        post
    }

    #[tokio::test]
    async fn collects_and_enriches_all_pages() {
        let mut api = MockApi::default();
        api.page_size = 2;
        api.search_results.insert(0, scripted_posts(5));
        api.likes.insert(
            "at://a/0".to_string(),
            vec![like_edge("did:plc:x", "x.test")],
        );
        let api = Arc::new(api);

        let tmp = TempDir::new().unwrap();
        let store = Arc::new(CheckpointStore::new(tmp.path(), "job"));
        let result = windowed_worker(Arc::clone(&api), Arc::clone(&store), &tmp, keyword_target(), 0)
            .run()
            .await
            .unwrap();

        assert_eq!(result.posts.len(), 5);
        assert_eq!(result.posts[0].likes.len(), 1);
        // The liker was reported as a participant.
        assert!(result.participants.iter().any(|u| u.did == "did:plc:x"));
        // Intermediates were cleaned up after the local merge.
        assert!(store.read_checkpoint(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resumes_from_checkpoint_without_refetching() {
        let mut api = MockApi::default();
        api.page_size = 2;
        api.search_results.insert(0, scripted_posts(4));
        // First run: page 1 succeeds, page 2 fails.
        api.fail_search_calls.insert(2);
        let api = Arc::new(api);

        let tmp = TempDir::new().unwrap();
        let store = Arc::new(CheckpointStore::new(tmp.path(), "job"));

        let err = windowed_worker(Arc::clone(&api), Arc::clone(&store), &tmp, keyword_target(), 0)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Api { .. }));
        let checkpoint = store.read_checkpoint(0).await.unwrap().unwrap();
        assert_eq!(checkpoint.items_total, 2);

        // Second run resumes and completes.
        let result = windowed_worker(Arc::clone(&api), Arc::clone(&store), &tmp, keyword_target(), 0)
            .run()
            .await
            .unwrap();
        assert_eq!(result.posts.len(), 4);

        // Posts from the first run were not enriched again.
        assert_eq!(api.count_calls("post_likes at://a/0"), 1);
    }

    #[tokio::test]
    async fn every_batch_cursor_matches_its_own_page() {
        let mut api = MockApi::default();
        api.page_size = 2;
        api.search_results.insert(0, scripted_posts(5));
        // Fail after two full pages so the intermediates survive.
        api.fail_search_calls.insert(3);
        let api = Arc::new(api);

        let tmp = TempDir::new().unwrap();
        let store = Arc::new(CheckpointStore::new(tmp.path(), "job"));
        windowed_worker(Arc::clone(&api), Arc::clone(&store), &tmp, keyword_target(), 0)
            .run()
            .await
            .unwrap_err();

        // One batch per page, each holding the cursor of the page it was
        // built from; resuming from any of them cannot skip unpersisted
        // posts.
        let batches = store.list_batches(0).await.unwrap();
        assert_eq!(batches, vec![1, 2]);
        let first = store.read_batch(0, 1).await.unwrap();
        assert_eq!(first.posts.len(), 2);
        assert_eq!(first.meta.cursor.as_deref(), Some("2"));
        let second = store.read_batch(0, 2).await.unwrap();
        assert_eq!(second.posts.len(), 2);
        assert_eq!(second.meta.cursor.as_deref(), Some("4"));
        let checkpoint = store.read_checkpoint(0).await.unwrap().unwrap();
        assert_eq!(checkpoint.last_batch, 2);

        // The rerun picks up the fifth post.
        let result = windowed_worker(api, store, &tmp, keyword_target(), 0)
            .run()
            .await
            .unwrap();
        assert_eq!(result.posts.len(), 5);
    }

    #[tokio::test]
    async fn finite_limit_truncates_mid_page() {
        let mut api = MockApi::default();
        api.page_size = 2;
        api.search_results.insert(0, scripted_posts(6));
        let api = Arc::new(api);

        let tmp = TempDir::new().unwrap();
        let store = Arc::new(CheckpointStore::new(tmp.path(), "job"));
        let result = windowed_worker(api, store, &tmp, keyword_target(), 3)
            .run()
            .await
            .unwrap();
        assert_eq!(result.posts.len(), 3);
    }

    #[tokio::test]
    async fn user_feed_is_filtered_to_the_window() {
        let mut api = MockApi::default();
        let in_window = in_window_post("at://alice/1");
        let mut too_old = flat_post("at://alice/2");
        too_old.created_at = Some("2023-12-01T00:00:00Z".to_string());
        api.user_feed
            .insert("alice.test".to_string(), vec![in_window, too_old]);
        let api = Arc::new(api);

        let tmp = TempDir::new().unwrap();
        let store = Arc::new(CheckpointStore::new(tmp.path(), "job"));
        let target = CollectionTarget::User {
            handle: "alice.test".to_string(),
        };
        let result = windowed_worker(api, store, &tmp, target, 0).run().await.unwrap();

        assert_eq!(result.posts.len(), 1);
        assert_eq!(result.posts[0].uri, "at://alice/1");
    }

    #[tokio::test]
    async fn user_share_walks_every_feed() {
        let mut api = MockApi::default();
        api.page_size = 2;
        api.user_feed.insert(
            "alice.test".to_string(),
            (0..3).map(|i| in_window_post(&format!("at://alice/{i}"))).collect(),
        );
        api.user_feed.insert(
            "bob.test".to_string(),
            vec![in_window_post("at://bob/0")],
        );
        let api = Arc::new(api);

        let tmp = TempDir::new().unwrap();
        let store = Arc::new(CheckpointStore::new(tmp.path(), "job"));
        let target = CollectionTarget::UserBatch {
            label: "discovered".to_string(),
        };
        let result = worker(
            api,
            store,
            &tmp,
            target,
            share_of(&["alice.test", "bob.test"]),
            0,
        )
        .run()
        .await
        .unwrap();

        let uris: Vec<&str> = result.posts.iter().map(|p| p.uri.as_str()).collect();
        assert_eq!(
            uris,
            vec!["at://alice/0", "at://alice/1", "at://alice/2", "at://bob/0"]
        );
    }

    #[tokio::test]
    async fn user_share_skips_an_aged_out_feed_tail() {
        let mut api = MockApi::default();
        let mut too_old = flat_post("at://alice/old");
        too_old.created_at = Some("2023-12-01T00:00:00Z".to_string());
        let mut older_still = flat_post("at://alice/older");
        older_still.created_at = Some("2023-11-01T00:00:00Z".to_string());
        api.page_size = 2;
        api.user_feed.insert(
            "alice.test".to_string(),
            vec![in_window_post("at://alice/0"), too_old, older_still],
        );
        api.user_feed.insert(
            "bob.test".to_string(),
            vec![in_window_post("at://bob/0")],
        );
        let api = Arc::new(api);

        let tmp = TempDir::new().unwrap();
        let store = Arc::new(CheckpointStore::new(tmp.path(), "job"));
        let target = CollectionTarget::UserBatch {
            label: "discovered".to_string(),
        };
        let result = worker(
            api,
            store,
            &tmp,
            target,
            share_of(&["alice.test", "bob.test"]),
            0,
        )
        .run()
        .await
        .unwrap();

        // Once alice's feed ages out of the window the worker jumps to
        // bob's feed instead of paging through her older posts.
        let uris: Vec<&str> = result.posts.iter().map(|p| p.uri.as_str()).collect();
        assert_eq!(uris, vec!["at://alice/0", "at://bob/0"]);
    }

    #[tokio::test]
    async fn completed_worker_is_not_rerun() {
        let mut api = MockApi::default();
        api.search_results.insert(0, scripted_posts(2));
        let api = Arc::new(api);

        let tmp = TempDir::new().unwrap();
        let store = Arc::new(CheckpointStore::new(tmp.path(), "job"));
        windowed_worker(Arc::clone(&api), Arc::clone(&store), &tmp, keyword_target(), 0)
            .run()
            .await
            .unwrap();
        let searches = api.count_calls("search_posts");

        let result = windowed_worker(Arc::clone(&api), store, &tmp, keyword_target(), 0)
            .run()
            .await
            .unwrap();
        assert_eq!(result.posts.len(), 2);
        assert_eq!(api.count_calls("search_posts"), searches);
    }

    #[tokio::test]
    async fn cancellation_leaves_no_partial_result() {
        let mut api = MockApi::default();
        api.search_results.insert(0, scripted_posts(2));

        let tmp = TempDir::new().unwrap();
        let store = Arc::new(CheckpointStore::new(tmp.path(), "job"));
        let collector = CollectorConfig {
            rate_limit_delay_ms: 0,
            ..CollectorConfig::default()
        };
        let worker = CollectionWorker::new(
            0,
            assignment(WorkerScope::Window(window()), 0),
            keyword_target(),
            Arc::new(api),
            Arc::new(UserRegistry::new(tmp.path().join("users"))),
            Arc::clone(&store),
            &collector,
            Arc::new(AtomicBool::new(true)),
        );

        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
        let result: Option<WorkerResult> = store.read_worker_result(0).await.unwrap();
        assert!(result.is_none());
    }
}
