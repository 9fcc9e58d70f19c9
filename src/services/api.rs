// src/services/api.rs

//! Remote API access.
//!
//! [`ApiClient`] is the seam between the collection engine and the wire
//! protocol: the engine only depends on this trait. [`AtpClient`] is the
//! production implementation speaking XRPC to an AT Protocol service,
//! with session authentication and bounded retry on transient failures.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::error::{AppError, Result};
use crate::models::{CollectorConfig, Credential, InteractionEdge, Post, SearchFilters, TimeWindow};
use crate::services::decode;

/// One page of a paginated response, plus the cursor valid after it.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            cursor: None,
        }
    }
}

/// Remote feed API used by workers and the recursive fetcher.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Establish a session for the given credential.
    async fn authenticate(&self, credential: &Credential) -> Result<()>;

    /// One page of keyword search results within a time window.
    async fn search_posts(
        &self,
        keyword: &str,
        filters: &SearchFilters,
        window: &TimeWindow,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Post>>;

    /// One page of a user's feed (no server-side time filter).
    async fn user_posts(
        &self,
        handle: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Post>>;

    /// One page of users who liked a post.
    async fn post_likes(&self, uri: &str, cursor: Option<&str>)
    -> Result<Page<InteractionEdge>>;

    /// One page of users who reposted a post.
    async fn post_reposts(
        &self,
        uri: &str,
        cursor: Option<&str>,
    ) -> Result<Page<InteractionEdge>>;

    /// One page of posts quoting a post.
    async fn post_quotes(&self, uri: &str, cursor: Option<&str>) -> Result<Page<Post>>;

    /// Immediate replies to a post.
    async fn post_replies(&self, uri: &str) -> Result<Vec<Post>>;

    /// Hydrated views for explicit post URIs.
    async fn get_posts(&self, uris: &[String]) -> Result<Vec<Post>>;
}

/// Page size used for interaction pagination.
const INTERACTION_PAGE_LIMIT: usize = 100;

/// Base backoff for transient failures; doubles per attempt.
const RETRY_BASE_MS: u64 = 500;

/// Backoff stops doubling after this many attempts (500ms << 6 = 32s).
const MAX_BACKOFF_SHIFT: u32 = 6;

/// Exponential backoff for the given attempt, capped so late attempts of
/// a large retry budget cannot overflow the shift.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(RETRY_BASE_MS << attempt.min(MAX_BACKOFF_SHIFT))
}

struct Session {
    access_jwt: String,
}

/// XRPC client for an AT Protocol service.
pub struct AtpClient {
    http: reqwest::Client,
    base_url: String,
    max_retries: u32,
    thread_depth: u32,
    session: RwLock<Option<Session>>,
}

impl AtpClient {
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.service_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            thread_depth: config.thread_depth,
            session: RwLock::new(None),
        })
    }

    fn endpoint(&self, nsid: &str) -> String {
        format!("{}/xrpc/{nsid}", self.base_url)
    }

    async fn try_login(&self, identifier: &str, password: &str) -> Result<Session> {
        let response = self
            .http
            .post(self.endpoint("com.atproto.server.createSession"))
            .json(&json!({"identifier": identifier, "password": password}))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::auth(identifier, format!("HTTP {status}")));
        }
        let body: Value = response.json().await?;
        let access_jwt = body
            .get("accessJwt")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::auth(identifier, "session response missing accessJwt"))?;
        Ok(Session {
            access_jwt: access_jwt.to_string(),
        })
    }

    /// GET an XRPC endpoint with bounded exponential backoff on timeouts,
    /// connection failures, rate-limit rejections, and server errors.
    async fn get_value(&self, nsid: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = self.endpoint(nsid);
        let mut attempt: u32 = 0;
        loop {
            let mut request = self.http.get(&url).query(params);
            if let Some(session) = self.session.read().await.as_ref() {
                request = request.bearer_auth(&session.access_jwt);
            }

            let retryable = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json::<Value>().await?);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        format!("HTTP {status}")
                    } else {
                        return Err(AppError::api(nsid, format!("HTTP {status}")));
                    }
                }
                Err(e) if e.is_timeout() || e.is_connect() => e.to_string(),
                Err(e) => return Err(AppError::Http(e)),
            };

            if attempt >= self.max_retries {
                return Err(AppError::api(
                    nsid,
                    format!("retries exhausted after {attempt} attempts: {retryable}"),
                ));
            }
            let backoff = backoff_delay(attempt);
            log::warn!("{nsid} failed ({retryable}), retrying in {backoff:?}");
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// Decode an array of post views, skipping items that defeat both the
    /// strict and the raw pass.
    fn decode_posts(nsid: &str, value: &Value, key: &str) -> Vec<Post> {
        let Some(items) = value.get(key).and_then(Value::as_array) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| match decode::decode_post_view(item) {
                Ok(decoded) => Some(decoded.into_post()),
                Err(e) => {
                    log::warn!("{nsid}: skipping undecodable item: {e}");
                    None
                }
            })
            .collect()
    }

    fn cursor_of(value: &Value) -> Option<String> {
        value.get("cursor").and_then(Value::as_str).map(str::to_string)
    }
}

#[async_trait]
impl ApiClient for AtpClient {
    async fn authenticate(&self, credential: &Credential) -> Result<()> {
        let session = match self.try_login(&credential.username, &credential.password).await {
            Ok(session) => session,
            Err(first_err) => match &credential.app_password {
                Some(app_password) => {
                    log::info!(
                        "Password login failed for {}; trying app password",
                        credential.username
                    );
                    self.try_login(&credential.username, app_password).await?
                }
                None => return Err(first_err),
            },
        };
        *self.session.write().await = Some(session);
        Ok(())
    }

    async fn search_posts(
        &self,
        keyword: &str,
        filters: &SearchFilters,
        window: &TimeWindow,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Post>> {
        let mut params = vec![
            ("q", keyword.to_string()),
            ("limit", limit.min(100).to_string()),
            ("since", window.since_param()),
            ("until", window.until_param()),
        ];
        let optional = [
            ("author", &filters.author),
            ("domain", &filters.domain),
            ("lang", &filters.lang),
            ("mentions", &filters.mentions),
            ("tag", &filters.tag),
            ("url", &filters.url),
            ("sort", &filters.sort),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                params.push((name, value.clone()));
            }
        }
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }

        let nsid = "app.bsky.feed.searchPosts";
        let value = self.get_value(nsid, &params).await?;
        Ok(Page {
            items: Self::decode_posts(nsid, &value, "posts"),
            cursor: Self::cursor_of(&value),
        })
    }

    async fn user_posts(
        &self,
        handle: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Post>> {
        let mut params = vec![
            ("actor", handle.to_string()),
            ("limit", limit.min(100).to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }

        let nsid = "app.bsky.feed.getAuthorFeed";
        let value = self.get_value(nsid, &params).await?;
        let items = value
            .get("feed")
            .and_then(Value::as_array)
            .map(|feed| {
                feed.iter()
                    .filter_map(|item| match decode::decode_feed_item(item) {
                        Ok(decoded) => Some(decoded.into_post()),
                        Err(e) => {
                            log::warn!("{nsid}: skipping undecodable feed item: {e}");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Page {
            items,
            cursor: Self::cursor_of(&value),
        })
    }

    async fn post_likes(
        &self,
        uri: &str,
        cursor: Option<&str>,
    ) -> Result<Page<InteractionEdge>> {
        let mut params = vec![
            ("uri", uri.to_string()),
            ("limit", INTERACTION_PAGE_LIMIT.to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        let value = self.get_value("app.bsky.feed.getLikes", &params).await?;
        let items = value
            .get("likes")
            .and_then(Value::as_array)
            .map(|likes| likes.iter().filter_map(decode::decode_like_edge).collect())
            .unwrap_or_default();
        Ok(Page {
            items,
            cursor: Self::cursor_of(&value),
        })
    }

    async fn post_reposts(
        &self,
        uri: &str,
        cursor: Option<&str>,
    ) -> Result<Page<InteractionEdge>> {
        let mut params = vec![
            ("uri", uri.to_string()),
            ("limit", INTERACTION_PAGE_LIMIT.to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        let value = self
            .get_value("app.bsky.feed.getRepostedBy", &params)
            .await?;
        let items = value
            .get("repostedBy")
            .and_then(Value::as_array)
            .map(|actors| actors.iter().filter_map(decode::decode_repost_edge).collect())
            .unwrap_or_default();
        Ok(Page {
            items,
            cursor: Self::cursor_of(&value),
        })
    }

    async fn post_quotes(&self, uri: &str, cursor: Option<&str>) -> Result<Page<Post>> {
        let mut params = vec![
            ("uri", uri.to_string()),
            ("limit", INTERACTION_PAGE_LIMIT.to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        let nsid = "app.bsky.feed.getQuotes";
        let value = self.get_value(nsid, &params).await?;
        Ok(Page {
            items: Self::decode_posts(nsid, &value, "posts"),
            cursor: Self::cursor_of(&value),
        })
    }

    async fn post_replies(&self, uri: &str) -> Result<Vec<Post>> {
        let params = vec![
            ("uri", uri.to_string()),
            ("depth", self.thread_depth.to_string()),
        ];
        let value = self
            .get_value("app.bsky.feed.getPostThread", &params)
            .await?;
        let Some(thread) = value.get("thread") else {
            return Ok(Vec::new());
        };
        Ok(decode::decode_thread_replies(thread)
            .into_iter()
            .map(decode::Decoded::into_post)
            .collect())
    }

    async fn get_posts(&self, uris: &[String]) -> Result<Vec<Post>> {
        let params: Vec<(&str, String)> =
            uris.iter().map(|uri| ("uris", uri.clone())).collect();
        let nsid = "app.bsky.feed.getPosts";
        let value = self.get_value(nsid, &params).await?;
        Ok(Self::decode_posts(nsid, &value, "posts"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_plateaus() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(6), Duration::from_secs(32));
        // Attempts beyond the plateau stay at the cap instead of shifting
        // the base out of range.
        assert_eq!(backoff_delay(7), Duration::from_secs(32));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(32));
    }
}
