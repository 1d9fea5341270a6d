// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of quill.
//
// quill is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// quill is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even
// the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General
// Public License for more details.
//
// You should have received a copy of the GNU General Public License along with quill.  If not, see
// <http://www.gnu.org/licenses/>.

//! # quill page cache
//!
//! Rendered listing pages are kept for a short while & served again to the same viewer for the
//! same URL. Writes don't invalidate anything; a reader may see a stale page until its entry
//! expires or the cache is cleared (by the operator, through the private router or SIGHUP).
//!
//! The cache is a service injected into the application state as a [PageCache] trait object;
//! [InMemoryPageCache] is the only implementation today.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header::CONTENT_TYPE, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use lru::LruCache;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, error};

use crate::{
    counter_add,
    entities::User,
    metrics::{self, Sort},
    quill::Quill,
};

/// Default capacity, in pages, of an [InMemoryPageCache]
pub const DEFAULT_CAPACITY: usize = 1024;

/// A response, as captured for re-serving
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CachedPage {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

impl IntoResponse for CachedPage {
    fn into_response(self) -> Response {
        let mut rsp = (self.status, self.body).into_response();
        if let Some(content_type) = self.content_type {
            rsp.headers_mut().insert(CONTENT_TYPE, content_type);
        }
        rsp
    }
}

/// Time-bounded store of rendered pages
#[async_trait]
pub trait PageCache {
    /// Look up `key`; entries past their deadline are never returned
    async fn get(&self, key: &str) -> Option<CachedPage>;
    /// Store `page` under `key` for `ttl`, replacing any existing entry
    async fn set(&self, key: String, page: CachedPage, ttl: Duration);
    /// Remove `key`; returns true if there was an entry to remove
    async fn expire(&self, key: &str) -> bool;
    async fn clear(&self);
}

/// An in-process, LRU-bounded [PageCache]
pub struct InMemoryPageCache {
    map: Mutex<LruCache<String, (CachedPage, Instant)>>,
}

impl std::fmt::Debug for InMemoryPageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPageCache").finish_non_exhaustive()
    }
}

impl InMemoryPageCache {
    pub fn new(capacity: usize) -> InMemoryPageCache {
        InMemoryPageCache {
            map: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }
}

impl Default for InMemoryPageCache {
    fn default() -> Self {
        InMemoryPageCache::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl PageCache for InMemoryPageCache {
    async fn get(&self, key: &str) -> Option<CachedPage> {
        let mut map = self.map.lock().await;
        if let Some((page, deadline)) = map.get(key) {
            if Instant::now() < *deadline {
                return Some(page.clone());
            }
        } else {
            return None;
        }
        map.pop(key);
        None
    }
    async fn set(&self, key: String, page: CachedPage, ttl: Duration) {
        self.map.lock().await.put(key, (page, Instant::now() + ttl));
    }
    async fn expire(&self, key: &str) -> bool {
        self.map.lock().await.pop(key).is_some()
    }
    async fn clear(&self) {
        self.map.lock().await.clear()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Middleware                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("cache.pages.hits", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("cache.pages.misses", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("cache.pages.stored", Sort::IntegralCounter) }

/// The cache key for a request: its path & query, plus the viewer (pages differ by viewer)
fn cache_key(request: &Request) -> String {
    let viewer = request
        .extensions()
        .get::<User>()
        .map(|user| user.username().to_string())
        .unwrap_or_default();
    format!("{}|{}", request.uri(), viewer)
}

/// Serve GET requests from the page cache, caching successful responses on a miss
///
/// Must run inside the session middleware, so that the viewer is known.
pub async fn cache_page(
    State(state): State<Arc<Quill>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let key = cache_key(&request);
    if let Some(page) = state.page_cache.get(&key).await {
        debug!("Page cache hit: {}", key);
        counter_add!(state.instruments, "cache.pages.hits", 1);
        return page.into_response();
    }
    counter_add!(state.instruments, "cache.pages.misses", 1);

    let rsp = next.run(request).await;
    if rsp.status() != StatusCode::OK {
        return rsp;
    }

    let (parts, body) = rsp.into_parts();
    match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => {
            let page = CachedPage {
                status: parts.status,
                content_type: parts.headers.get(CONTENT_TYPE).cloned(),
                body: body.clone(),
            };
            state.page_cache.set(key, page, state.cache_ttl).await;
            counter_add!(state.instruments, "cache.pages.stored", 1);
            Response::from_parts(parts, Body::from(body))
        }
        Err(err) => {
            error!("Failed to buffer a response for the page cache: {:#?}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn page(text: &'static str) -> CachedPage {
        CachedPage {
            status: StatusCode::OK,
            content_type: Some(HeaderValue::from_static("text/html; charset=utf-8")),
            body: Bytes::from_static(text.as_bytes()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = InMemoryPageCache::default();
        cache
            .set("/|".to_owned(), page("one"), Duration::from_secs(20))
            .await;
        assert_eq!(cache.get("/|").await, Some(page("one")));

        tokio::time::advance(Duration::from_secs(19)).await;
        assert_eq!(cache.get("/|").await, Some(page("one")));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("/|").await, None);
    }

    #[tokio::test]
    async fn expire_and_clear() {
        let cache = InMemoryPageCache::new(2);
        cache
            .set("a".to_owned(), page("a"), Duration::from_secs(20))
            .await;
        cache
            .set("b".to_owned(), page("b"), Duration::from_secs(20))
            .await;
        assert!(cache.expire("a").await);
        assert!(!cache.expire("a").await);
        assert!(cache.get("b").await.is_some());
        cache.clear().await;
        assert!(cache.get("b").await.is_none());
    }

    #[tokio::test]
    async fn capacity_is_bounded() {
        let cache = InMemoryPageCache::new(2);
        for key in ["a", "b", "c"] {
            cache
                .set(key.to_owned(), page("x"), Duration::from_secs(20))
                .await;
        }
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_some());
        assert!(cache.get("c").await.is_some());
    }
}
