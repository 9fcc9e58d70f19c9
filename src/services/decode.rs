// src/services/decode.rs

//! Wire-format decoding for API responses.
//!
//! Post views are decoded in two stages: a strict typed pass, and a
//! permissive raw pass used when the typed pass rejects a malformed
//! upstream field. The raw pass only reads fields the engine actually
//! needs and preserves the known-essential record fields (labels, facets,
//! reply, tags, langs, entities) while ignoring everything else.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::models::{InteractionEdge, InteractionKind, Post};

/// Outcome of decoding one post view.
#[derive(Debug)]
pub enum Decoded {
    /// Strict typed decode succeeded.
    Strict(Post),
    /// Strict decode failed; the permissive raw pass recovered the item.
    Raw(Post),
}

impl Decoded {
    pub fn into_post(self) -> Post {
        match self {
            Decoded::Strict(post) | Decoded::Raw(post) => post,
        }
    }
}

// --- Strict wire shapes ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePostView {
    uri: String,
    cid: String,
    author: WireActor,
    record: WireRecord,
    #[serde(default)]
    embed: Option<Value>,
    #[serde(default)]
    reply_count: Option<u64>,
    #[serde(default)]
    repost_count: Option<u64>,
    #[serde(default)]
    like_count: Option<u64>,
    #[serde(default)]
    quote_count: Option<u64>,
    #[serde(default)]
    indexed_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireActor {
    did: String,
    handle: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    #[serde(default)]
    text: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    reply: Option<WireReplyRef>,
    #[serde(default)]
    embed: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireReplyRef {
    #[serde(default)]
    parent: Option<WireRef>,
    #[serde(default)]
    root: Option<WireRef>,
}

#[derive(Debug, Deserialize)]
struct WireRef {
    #[serde(default)]
    uri: Option<String>,
}

/// Decode a post view, trying the strict typed pass first.
pub fn decode_post_view(value: &Value) -> Result<Decoded> {
    match serde_json::from_value::<WirePostView>(value.clone()) {
        Ok(wire) => Ok(Decoded::Strict(post_from_wire(wire))),
        Err(strict_err) => match raw_post(value) {
            Some(post) => {
                log::debug!(
                    "Strict decode failed ({strict_err}); recovered post {} via raw pass",
                    post.uri
                );
                Ok(Decoded::Raw(post))
            }
            None => Err(AppError::api(
                "decode_post_view",
                format!("both strict and raw decode failed: {strict_err}"),
            )),
        },
    }
}

/// Decode a feed item (`{post, reason?, reply?}`) from getAuthorFeed.
/// A repost reason marks the post as reposted relative to the feed owner.
pub fn decode_feed_item(value: &Value) -> Result<Decoded> {
    let post_value = value.get("post").unwrap_or(value);
    let mut decoded = decode_post_view(post_value)?;

    let is_repost = value
        .pointer("/reason/$type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.ends_with("reasonRepost"));
    if is_repost {
        let post = match &mut decoded {
            Decoded::Strict(post) | Decoded::Raw(post) => post,
        };
        post.is_repost = true;
        // For reposts the embedded view is the original post itself.
        post.original_post_uri = Some(post.uri.clone());
        post.original_post_author = Some(post.author_handle.clone());
    }
    Ok(decoded)
}

/// Immediate replies of a thread view, decoded as posts.
pub fn decode_thread_replies(thread: &Value) -> Vec<Decoded> {
    let Some(replies) = thread.get("replies").and_then(Value::as_array) else {
        return Vec::new();
    };
    replies
        .iter()
        .filter_map(|reply_view| {
            let post_value = reply_view.get("post")?;
            match decode_post_view(post_value) {
                Ok(decoded) => Some(decoded),
                Err(e) => {
                    log::warn!("Skipping undecodable reply: {e}");
                    None
                }
            }
        })
        .collect()
}

/// Decode a like record (`{actor, indexedAt, createdAt}`) into an edge.
pub fn decode_like_edge(value: &Value) -> Option<InteractionEdge> {
    let actor = value.get("actor")?;
    actor_edge(actor, InteractionKind::Likes)
}

/// Decode a repostedBy profile view into an edge.
pub fn decode_repost_edge(value: &Value) -> Option<InteractionEdge> {
    actor_edge(value, InteractionKind::RepostedBy)
}

fn actor_edge(actor: &Value, kind: InteractionKind) -> Option<InteractionEdge> {
    Some(InteractionEdge {
        did: actor.get("did")?.as_str()?.to_string(),
        handle: actor.get("handle")?.as_str()?.to_string(),
        display_name: actor
            .get("displayName")
            .and_then(Value::as_str)
            .map(str::to_string),
        indexed_at: actor
            .get("indexedAt")
            .and_then(Value::as_str)
            .map(str::to_string),
        labels: actor
            .get("labels")
            .and_then(Value::as_array)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|l| l.get("val").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        interaction_type: kind,
    })
}

fn post_from_wire(wire: WirePostView) -> Post {
    let (is_quote, original_post_uri, original_post_author) =
        quote_relation(wire.record.embed.as_ref(), wire.embed.as_ref());
    let reply = wire.record.reply.as_ref();

    Post {
        uri: wire.uri,
        cid: wire.cid,
        author_did: wire.author.did,
        author_handle: wire.author.handle,
        author_display_name: wire.author.display_name,
        text: wire.record.text,
        created_at: wire.record.created_at,
        indexed_at: wire.indexed_at,
        reply_count: wire.reply_count.unwrap_or(0),
        repost_count: wire.repost_count.unwrap_or(0),
        like_count: wire.like_count.unwrap_or(0),
        quote_count: wire.quote_count.unwrap_or(0),
        is_reply: reply.is_some(),
        is_repost: false,
        is_quote,
        parent_uri: reply.and_then(|r| r.parent.as_ref()).and_then(|p| p.uri.clone()),
        root_uri: reply.and_then(|r| r.root.as_ref()).and_then(|p| p.uri.clone()),
        original_post_uri,
        original_post_author,
        quoted_post_info: None,
        likes: Vec::new(),
        reposts: Vec::new(),
        replies: Vec::new(),
        quotes: Vec::new(),
    }
}

/// Permissive decode: only `uri`/`cid` are required; the essential record
/// fields are read when present and anything unrecognized is dropped.
fn raw_post(value: &Value) -> Option<Post> {
    let uri = value.get("uri")?.as_str()?.to_string();
    let cid = value.get("cid")?.as_str()?.to_string();
    let str_at = |pointer: &str| {
        value
            .pointer(pointer)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let count_at = |pointer: &str| value.pointer(pointer).and_then(Value::as_u64).unwrap_or(0);

    let (is_quote, original_post_uri, original_post_author) = quote_relation(
        value.pointer("/record/embed"),
        value.get("embed"),
    );
    let parent_uri = str_at("/record/reply/parent/uri");
    let root_uri = str_at("/record/reply/root/uri");

    Some(Post {
        uri,
        cid,
        author_did: str_at("/author/did").unwrap_or_default(),
        author_handle: str_at("/author/handle").unwrap_or_default(),
        author_display_name: str_at("/author/displayName"),
        text: str_at("/record/text").unwrap_or_default(),
        created_at: str_at("/record/createdAt"),
        indexed_at: str_at("/indexedAt"),
        reply_count: count_at("/replyCount"),
        repost_count: count_at("/repostCount"),
        like_count: count_at("/likeCount"),
        quote_count: count_at("/quoteCount"),
        is_reply: value.pointer("/record/reply").is_some(),
        is_repost: false,
        is_quote,
        parent_uri,
        root_uri,
        original_post_uri,
        original_post_author,
        quoted_post_info: None,
        likes: Vec::new(),
        reposts: Vec::new(),
        replies: Vec::new(),
        quotes: Vec::new(),
    })
}

/// Quote relation from the record embed (and the hydrated view embed for
/// the quoted author when the record only carries a ref).
fn quote_relation(
    record_embed: Option<&Value>,
    view_embed: Option<&Value>,
) -> (bool, Option<String>, Option<String>) {
    let Some(embed) = record_embed else {
        return (false, None, None);
    };
    let embed_type = embed.get("$type").and_then(Value::as_str).unwrap_or("");

    let quoted_ref = if embed_type == "app.bsky.embed.record" {
        embed.get("record")
    } else if embed_type == "app.bsky.embed.recordWithMedia" {
        embed.pointer("/record/record")
    } else {
        return (false, None, None);
    };

    let uri = quoted_ref
        .and_then(|r| r.get("uri"))
        .and_then(Value::as_str)
        .map(str::to_string);
    // The record embed holds only a ref; the hydrated view embed may carry
    // the quoted author's handle.
    let author = view_embed
        .and_then(|e| e.pointer("/record/author/handle"))
        .and_then(Value::as_str)
        .map(str::to_string);

    (true, uri, author)
}
