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

//! # quill
//!
//! A small multi-user blogging service: people post (optionally filing the post under a topical
//! group & attaching an image), comment on each other's posts & follow the authors they like to
//! build a personal feed.
//!
//! The library holds everything but process setup, which lives in the `quilld` daemon (along with
//! the `quill-admin` tool). [make_site_router] assembles the public site from an application
//! state [Quill]; the daemon wraps that in tracing & request-id layers & serves it.
//!
//! [Quill]: crate::quill::Quill

pub mod authn;
pub mod cache;
pub mod config;
pub mod entities;
pub mod forms;
pub mod http;
pub mod media;
pub mod metrics;
pub mod pagination;
pub mod peppers;
pub mod posts;
pub mod quill;
pub mod signing_keys;
pub mod sqlite;
pub mod storage;
pub mod templates;
pub mod token;
pub mod users;
pub mod util;

use std::sync::Arc;

use axum::Router;
use tower_http::services::ServeDir;

use crate::quill::Quill;

/// Assemble the public site
///
/// Every route runs beneath the session middleware, so handlers (and the page cache) can see who's
/// asking. Uploaded images are served from the media root under `/media/`; anything else that
/// matches no route gets the themed 404 page.
pub fn make_site_router(state: Arc<Quill>) -> Router {
    let media = ServeDir::new(state.media.root());
    Router::new()
        .merge(posts::make_router(state.clone()))
        .merge(users::make_router(state.clone()))
        .nest_service("/media", media)
        .fallback(http::not_found)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            authn::authenticate,
        ))
        .with_state(state)
}
