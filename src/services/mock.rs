// src/services/mock.rs

//! Scripted in-memory [`ApiClient`] for worker, fetcher, and orchestrator
//! tests. Pagination cursors are numeric offsets into the scripted lists.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::models::{Credential, InteractionEdge, Post, SearchFilters, TimeWindow};
use crate::services::api::{ApiClient, Page};

#[derive(Default)]
pub(crate) struct MockApi {
    /// Server-side page size; 0 means everything in one page.
    pub page_size: usize,
    /// Search results keyed by the window's worker index.
    pub search_results: HashMap<usize, Vec<Post>>,
    /// Author feeds keyed by handle.
    pub user_feed: HashMap<String, Vec<Post>>,
    pub likes: HashMap<String, Vec<InteractionEdge>>,
    pub reposts: HashMap<String, Vec<InteractionEdge>>,
    pub quotes: HashMap<String, Vec<Post>>,
    pub replies: HashMap<String, Vec<Post>>,
    /// Hydrated views served by `get_posts`, keyed by uri.
    pub hydrated: HashMap<String, Post>,
    /// Usernames whose login always fails.
    pub fail_logins: HashSet<String>,
    /// 1-based search call numbers that fail with a transient error.
    pub fail_search_calls: HashSet<usize>,
    search_counter: Mutex<usize>,
    /// Every API call, recorded as "method uri-or-query".
    pub calls: Mutex<Vec<String>>,
}

impl MockApi {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn page_of<T: Clone>(&self, items: Option<&Vec<T>>, cursor: Option<&str>, limit: usize) -> Page<T> {
        let Some(items) = items else {
            return Page::empty();
        };
        let offset = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let size = if self.page_size == 0 { usize::MAX } else { self.page_size };
        let take = size.min(limit.max(1));
        let page: Vec<T> = items.iter().skip(offset).take(take).cloned().collect();
        let next = offset + page.len();
        let cursor = (next < items.len()).then(|| next.to_string());
        Page { items: page, cursor }
    }
}

#[async_trait]
impl ApiClient for MockApi {
    async fn authenticate(&self, credential: &Credential) -> Result<()> {
        self.record(format!("authenticate {}", credential.username));
        if self.fail_logins.contains(&credential.username) {
            return Err(AppError::auth(&credential.username, "invalid credentials"));
        }
        Ok(())
    }

    async fn search_posts(
        &self,
        keyword: &str,
        _filters: &SearchFilters,
        window: &TimeWindow,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Post>> {
        self.record(format!("search_posts {keyword} w{}", window.worker_index));
        let call = {
            let mut counter = self.search_counter.lock().unwrap();
            *counter += 1;
            *counter
        };
        if self.fail_search_calls.contains(&call) {
            return Err(AppError::api("search_posts", "scripted transient failure"));
        }
        Ok(self.page_of(self.search_results.get(&window.worker_index), cursor, limit))
    }

    async fn user_posts(
        &self,
        handle: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Post>> {
        self.record(format!("user_posts {handle}"));
        Ok(self.page_of(self.user_feed.get(handle), cursor, limit))
    }

    async fn post_likes(&self, uri: &str, cursor: Option<&str>) -> Result<Page<InteractionEdge>> {
        self.record(format!("post_likes {uri}"));
        Ok(self.page_of(self.likes.get(uri), cursor, usize::MAX))
    }

    async fn post_reposts(&self, uri: &str, cursor: Option<&str>) -> Result<Page<InteractionEdge>> {
        self.record(format!("post_reposts {uri}"));
        Ok(self.page_of(self.reposts.get(uri), cursor, usize::MAX))
    }

    async fn post_quotes(&self, uri: &str, cursor: Option<&str>) -> Result<Page<Post>> {
        self.record(format!("post_quotes {uri}"));
        Ok(self.page_of(self.quotes.get(uri), cursor, usize::MAX))
    }

    async fn post_replies(&self, uri: &str) -> Result<Vec<Post>> {
        self.record(format!("post_replies {uri}"));
        Ok(self.replies.get(uri).cloned().unwrap_or_default())
    }

    async fn get_posts(&self, uris: &[String]) -> Result<Vec<Post>> {
        self.record(format!("get_posts {}", uris.join(",")));
        Ok(uris
            .iter()
            .filter_map(|uri| self.hydrated.get(uri).cloned())
            .collect())
    }
}
