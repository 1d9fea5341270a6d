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

//! # HTTP odds & ends
//!
//! Helpers shared by the handlers: redirects, rendering templates into responses & the themed
//! error pages.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header::LOCATION, HeaderValue, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
};
use tracing::error;

use crate::{
    authn::Viewer,
    counter_add,
    entities::User,
    metrics::{self, Sort},
    quill::Quill,
};

/// 302 Found, pointing at `location`
pub fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut rsp = StatusCode::FOUND.into_response();
            rsp.headers_mut().insert(LOCATION, value);
            rsp
        }
        Err(err) => {
            error!("Refusing to redirect to {:?}: {}", location, err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

inventory::submit! { metrics::Registration::new("http.render.failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("http.not-found", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("http.internal-errors", Sort::IntegralCounter) }

/// Render template `name` with `status`; every template gets the viewer (or null)
pub fn render(
    state: &Quill,
    viewer: Option<&User>,
    status: StatusCode,
    name: &str,
    mut context: tera::Context,
) -> Response {
    context.insert("viewer", &viewer);
    match state.templates.render(name, &context) {
        Ok(body) => (status, Html(body)).into_response(),
        Err(err) => {
            error!("Failed to render {}: {:#?}", name, err);
            counter_add!(state.instruments, "http.render.failures", 1);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}

/// Render template `name` as a 200
pub fn page(state: &Quill, viewer: Option<&User>, name: &str, context: tera::Context) -> Response {
    render(state, viewer, StatusCode::OK, name, context)
}

/// The themed 404 page
pub fn not_found_page(state: &Quill, viewer: Option<&User>, path: &str) -> Response {
    counter_add!(state.instruments, "http.not-found", 1);
    let mut context = tera::Context::new();
    context.insert("path", path);
    render(state, viewer, StatusCode::NOT_FOUND, "404.html", context)
}

/// The themed 500 page; log `err` before calling this
pub fn internal_error_page(state: &Quill, viewer: Option<&User>) -> Response {
    counter_add!(state.instruments, "http.internal-errors", 1);
    render(
        state,
        viewer,
        StatusCode::INTERNAL_SERVER_ERROR,
        "500.html",
        tera::Context::new(),
    )
}

/// Fallback handler for paths matching no route
pub async fn not_found(State(state): State<Arc<Quill>>, viewer: Viewer, uri: Uri) -> Response {
    not_found_page(&state, viewer.user(), uri.path())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn redirects() {
        let rsp = found("/profile/leo/");
        assert_eq!(rsp.status(), StatusCode::FOUND);
        assert_eq!(
            rsp.headers().get(LOCATION),
            Some(&HeaderValue::from_static("/profile/leo/"))
        );
        assert_eq!(
            found("/bad\nheader").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
