// src/models/post.rs

//! Post and interaction data structures.
//!
//! A [`Post`] carries its full interaction tree: flat like/repost edges
//! plus recursively expanded reply/quote posts. The `uri` is the dedup
//! key everywhere; two records with the same `uri` describe the same
//! post and are reconciled with the richer-wins rule.

use serde::{Deserialize, Serialize};

/// Which interaction list an edge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionKind {
    #[serde(rename = "likes")]
    Likes,
    #[serde(rename = "reposted_by")]
    RepostedBy,
}

/// A user reference attached to a post's like/repost list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionEdge {
    pub did: String,
    pub handle: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(rename = "indexedAt", default)]
    pub indexed_at: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub interaction_type: InteractionKind,
}

/// Embedded snapshot of a quoted post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotedPost {
    pub uri: String,
    pub author_handle: Option<String>,
    pub author_did: Option<String>,
    pub text: String,
    pub created_at: Option<String>,
}

/// A collected post with its interaction tree.
///
/// The relationship flags (`is_reply`/`is_repost`/`is_quote`) describe how
/// the post relates to the entity being collected, not intrinsic
/// properties of the post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    /// Globally unique post identifier; the dedup key.
    pub uri: String,

    /// Content hash.
    pub cid: String,

    pub author_did: String,
    pub author_handle: String,
    #[serde(rename = "author_displayName", default)]
    pub author_display_name: Option<String>,

    #[serde(default)]
    pub text: String,

    /// Raw API timestamps; field normalization is the client's concern.
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub indexed_at: Option<String>,

    #[serde(default)]
    pub reply_count: u64,
    #[serde(default)]
    pub repost_count: u64,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub quote_count: u64,

    #[serde(default)]
    pub is_reply: bool,
    #[serde(default)]
    pub is_repost: bool,
    #[serde(default)]
    pub is_quote: bool,

    #[serde(default)]
    pub parent_uri: Option<String>,
    #[serde(default)]
    pub root_uri: Option<String>,
    #[serde(default)]
    pub original_post_uri: Option<String>,
    #[serde(default)]
    pub original_post_author: Option<String>,

    #[serde(default)]
    pub quoted_post_info: Option<QuotedPost>,

    #[serde(default)]
    pub likes: Vec<InteractionEdge>,
    #[serde(default)]
    pub reposts: Vec<InteractionEdge>,
    #[serde(default)]
    pub replies: Vec<Post>,
    #[serde(default)]
    pub quotes: Vec<Post>,
}

impl Post {
    /// True if the post is an original relative to the collection query,
    /// i.e. not a reply, repost, or quote of something else.
    pub fn is_original(&self) -> bool {
        !(self.is_reply || self.is_repost || self.is_quote)
    }

    /// Richer-wins comparison used by the merge protocol.
    ///
    /// A copy with expanded reply/quote trees must never be replaced by a
    /// flat copy of the same post. When neither side has a deeper tree the
    /// caller keeps the most recently fetched copy.
    pub fn is_richer_than(&self, other: &Post) -> bool {
        let self_deep = !self.replies.is_empty() || !self.quotes.is_empty();
        let other_deep = !other.replies.is_empty() || !other.quotes.is_empty();
        self_deep && !other_deep
    }
}

/// A user observed anywhere during collection, deduplicated by `did`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredUser {
    pub did: String,
    pub handle: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
}

impl DiscoveredUser {
    /// Fill in a previously-missing display name. Existing names are kept.
    pub fn absorb(&mut self, other: &DiscoveredUser) {
        if self.display_name.as_deref().unwrap_or("").is_empty() {
            if let Some(name) = &other.display_name {
                if !name.is_empty() {
                    self.display_name = Some(name.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testutil::flat_post;

    #[test]
    fn expanded_copy_is_richer_than_flat() {
        let flat = flat_post("at://a/1");
        let mut deep = flat_post("at://a/1");
        deep.replies.push(flat_post("at://b/2"));

        assert!(deep.is_richer_than(&flat));
        assert!(!flat.is_richer_than(&deep));
    }

    #[test]
    fn equally_flat_copies_are_not_richer() {
        let a = flat_post("at://a/1");
        let b = flat_post("at://a/1");
        assert!(!a.is_richer_than(&b));
        assert!(!b.is_richer_than(&a));
    }

    #[test]
    fn absorb_backfills_missing_display_name() {
        let mut user = DiscoveredUser {
            did: "did:plc:x".to_string(),
            handle: "x.bsky.social".to_string(),
            display_name: None,
        };
        let richer = DiscoveredUser {
            display_name: Some("X".to_string()),
            ..user.clone()
        };
        user.absorb(&richer);
        assert_eq!(user.display_name.as_deref(), Some("X"));

        // An existing name is never overwritten.
        let other = DiscoveredUser {
            display_name: Some("Y".to_string()),
            ..user.clone()
        };
        user.absorb(&other);
        assert_eq!(user.display_name.as_deref(), Some("X"));
    }
}
