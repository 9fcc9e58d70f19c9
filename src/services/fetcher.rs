// src/services/fetcher.rs

//! Recursive interaction-tree expansion.
//!
//! Only original posts get the full treatment: likes, reposts, replies,
//! and quotes, with every reply/quote expanded in turn. Posts that are
//! themselves replies, reposts, or quotes of something else stay at depth
//! zero (flat edges and counters only), so collection never chases an
//! entire foreign thread because one reply matched the query.
//!
//! Quote graphs can contain cycles. A [`RecursionPath`] tracks the uris
//! on the current expansion path; a post already on the path is kept as a
//! flat node instead of being expanded again, which bounds the recursion.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::{DiscoveredUser, InteractionEdge, Post, QuotedPost};
use crate::services::api::ApiClient;
use crate::storage::UserRegistry;

/// Uris on the current expansion path, per top-level call.
#[derive(Default)]
struct RecursionPath {
    active: HashSet<String>,
}

impl RecursionPath {
    /// Returns false if the uri is already on the path.
    fn enter(&mut self, uri: &str) -> bool {
        self.active.insert(uri.to_string())
    }

    fn leave(&mut self, uri: &str) {
        self.active.remove(uri);
    }
}

/// Expands posts in place and reports the users it discovered.
pub struct RecursiveFetcher {
    api: Arc<dyn ApiClient>,
    registry: Arc<UserRegistry>,
    /// Keyword runs scope discovered users to a topic file as well.
    topic: Option<String>,
    delay: Duration,
    /// Hydrated quoted-post snapshots, one `get_posts` call per uri.
    quoted_memo: Mutex<HashMap<String, QuotedPost>>,
}

impl RecursiveFetcher {
    pub fn new(
        api: Arc<dyn ApiClient>,
        registry: Arc<UserRegistry>,
        topic: Option<String>,
        delay: Duration,
    ) -> Self {
        Self {
            api,
            registry,
            topic,
            delay,
            quoted_memo: Mutex::new(HashMap::new()),
        }
    }

    /// Enrich one top-level post: full recursive expansion for originals,
    /// depth-zero for replies/reposts/quotes. Registers every discovered
    /// user and returns them (deduplicated by did) for batch bookkeeping.
    pub async fn enrich(&self, post: &mut Post) -> Result<Vec<DiscoveredUser>> {
        let mut seen: Vec<DiscoveredUser> = Vec::new();
        if post.is_original() {
            let mut path = RecursionPath::default();
            self.expand(post, &mut path, &mut seen).await?;
        } else {
            note_author(post, &mut seen);
            self.attach_flat(post, &mut seen).await?;
        }

        let mut by_did = HashSet::new();
        seen.retain(|user| by_did.insert(user.did.clone()));
        self.registry.register(&seen, self.topic.as_deref()).await?;
        Ok(seen)
    }

    /// Full expansion of one post and everything below it.
    fn expand<'a>(
        &'a self,
        post: &'a mut Post,
        path: &'a mut RecursionPath,
        seen: &'a mut Vec<DiscoveredUser>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if !path.enter(&post.uri) {
                log::debug!("cycle at {}, keeping flat", post.uri);
                return Ok(());
            }
            note_author(post, seen);
            self.attach_flat(post, seen).await?;

            let mut replies = self.api.post_replies(&post.uri).await?;
            self.pace().await;
            for child in &mut replies {
                self.expand(child, path, seen).await?;
            }
            post.replies = replies;

            let mut quotes = self.collect_quotes(&post.uri).await?;
            for child in &mut quotes {
                self.expand(child, path, seen).await?;
            }
            post.quotes = quotes;

            path.leave(&post.uri);
            Ok(())
        })
    }

    /// Depth-zero enrichment: like/repost edges and the quoted snapshot.
    async fn attach_flat(&self, post: &mut Post, seen: &mut Vec<DiscoveredUser>) -> Result<()> {
        post.likes = self.collect_likes(&post.uri).await?;
        post.reposts = self.collect_reposts(&post.uri).await?;
        note_edges(&post.likes, seen);
        note_edges(&post.reposts, seen);
        self.ensure_quoted_snapshot(post, seen).await
    }

    async fn collect_likes(&self, uri: &str) -> Result<Vec<InteractionEdge>> {
        let mut edges = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.api.post_likes(uri, cursor.as_deref()).await?;
            self.pace().await;
            let got = page.items.len();
            edges.extend(page.items);
            cursor = page.cursor;
            if cursor.is_none() || got == 0 {
                return Ok(edges);
            }
        }
    }

    async fn collect_reposts(&self, uri: &str) -> Result<Vec<InteractionEdge>> {
        let mut edges = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.api.post_reposts(uri, cursor.as_deref()).await?;
            self.pace().await;
            let got = page.items.len();
            edges.extend(page.items);
            cursor = page.cursor;
            if cursor.is_none() || got == 0 {
                return Ok(edges);
            }
        }
    }

    async fn collect_quotes(&self, uri: &str) -> Result<Vec<Post>> {
        let mut quotes = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.api.post_quotes(uri, cursor.as_deref()).await?;
            self.pace().await;
            let got = page.items.len();
            quotes.extend(page.items);
            cursor = page.cursor;
            if cursor.is_none() || got == 0 {
                return Ok(quotes);
            }
        }
    }

    /// Fill in `quoted_post_info` for a quote post whose embed did not
    /// carry the quoted record, hydrating via `get_posts` at most once per
    /// quoted uri. The quoted author counts as a discovered user.
    async fn ensure_quoted_snapshot(
        &self,
        post: &mut Post,
        seen: &mut Vec<DiscoveredUser>,
    ) -> Result<()> {
        if !post.is_quote || post.quoted_post_info.is_some() {
            return Ok(());
        }
        let Some(quoted_uri) = post.original_post_uri.clone() else {
            return Ok(());
        };

        if let Some(snapshot) = self.quoted_memo.lock().await.get(&quoted_uri) {
            note_quoted_author(snapshot, seen);
            post.quoted_post_info = Some(snapshot.clone());
            return Ok(());
        }

        let hydrated = self.api.get_posts(std::slice::from_ref(&quoted_uri)).await?;
        self.pace().await;
        match hydrated.into_iter().next() {
            Some(quoted) => {
                note_author(&quoted, seen);
                let snapshot = QuotedPost {
                    uri: quoted.uri,
                    author_handle: Some(quoted.author_handle),
                    author_did: Some(quoted.author_did),
                    text: quoted.text,
                    created_at: quoted.created_at,
                };
                self.quoted_memo
                    .lock()
                    .await
                    .insert(quoted_uri, snapshot.clone());
                post.quoted_post_info = Some(snapshot);
            }
            // Deleted or blocked quoted post; leave the snapshot empty.
            None => log::debug!("quoted post {quoted_uri} not resolvable"),
        }
        Ok(())
    }

    async fn pace(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

fn note_author(post: &Post, seen: &mut Vec<DiscoveredUser>) {
    seen.push(DiscoveredUser {
        did: post.author_did.clone(),
        handle: post.author_handle.clone(),
        display_name: post.author_display_name.clone(),
    });
}

fn note_quoted_author(snapshot: &QuotedPost, seen: &mut Vec<DiscoveredUser>) {
    if let (Some(did), Some(handle)) = (&snapshot.author_did, &snapshot.author_handle) {
        seen.push(DiscoveredUser {
            did: did.clone(),
            handle: handle.clone(),
            display_name: None,
        });
    }
}

fn note_edges(edges: &[InteractionEdge], seen: &mut Vec<DiscoveredUser>) {
    for edge in edges {
        seen.push(DiscoveredUser {
            did: edge.did.clone(),
            handle: edge.handle.clone(),
            display_name: edge.display_name.clone(),
        });
    }
}
