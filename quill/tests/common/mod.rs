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

//! Shared fixtures for the quill integration tests: an in-memory site, users & a few request
//! helpers.

// Each test binary uses a different subset of these.
#![allow(dead_code)]

use std::{sync::Arc, time::Duration as StdDuration};

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use chrono::Duration;
use secrecy::SecretString;
use tempfile::TempDir;
use tower::ServiceExt;

use quill::{
    authn::SESSION_COOKIE,
    cache::InMemoryPageCache,
    entities::{Post, PostText, User, Username},
    make_site_router,
    media::MediaStore,
    metrics::Instruments,
    peppers::Peppers,
    quill::Quill,
    signing_keys::SigningKeys,
    sqlite,
    templates,
    token::mint_token,
};

pub const PASSWORD: &str = "vZ7#qL2!mB9xPw";

/// The eight-byte PNG signature followed by the start of an IHDR chunk
pub const PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00,
];

const BOUNDARY: &str = "quill-test-boundary";

/// One field of a multipart form
pub enum Part<'a> {
    Text(&'a str, &'a str),
    /// field name, file name & contents
    File(&'a str, &'a str, &'a [u8]),
}

fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                        name, value
                    )
                    .as_bytes(),
                );
            }
            Part::File(name, file_name, contents) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n",
                        name, file_name
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(contents);
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

/// A quill site backed by an in-memory database & a scratch media directory
pub struct Site {
    pub state: Arc<Quill>,
    pub router: Router,
    // Removed on drop
    _media: TempDir,
}

pub async fn site() -> Site {
    let media = tempfile::tempdir().unwrap();
    let storage = sqlite::Session::new("sqlite::memory:", 1).await.unwrap();
    let state = Arc::new(Quill {
        storage: Arc::new(storage),
        page_cache: Arc::new(InMemoryPageCache::default()),
        templates: templates::load().unwrap(),
        instruments: Arc::new(Instruments::new("quill")),
        peppers: Peppers::default(),
        signing_keys: SigningKeys::default(),
        issuer: "test".to_owned(),
        session_lifetime: Duration::days(1),
        secure_cookies: false,
        page_size: 10,
        cache_ttl: StdDuration::from_secs(20),
        media: MediaStore::new(media.path()),
    });
    Site {
        router: make_site_router(state.clone()),
        state,
        _media: media,
    }
}

impl Site {
    /// Sign-up `name` directly through storage
    pub async fn user(&self, name: &str, display_name: &str) -> User {
        let (version, pepper) = self.state.peppers.current_pepper().unwrap();
        let user = User::new(
            &version,
            &pepper,
            &Username::new(name).unwrap(),
            &SecretString::from(PASSWORD),
            Some(display_name),
        )
        .unwrap();
        self.state.storage.add_user(&user).await.unwrap();
        user
    }
    /// A `Cookie` header value logging-in `user`
    pub fn cookie(&self, user: &User) -> String {
        let (keyid, key) = self.state.signing_keys.current().unwrap();
        let token = mint_token(
            user.username(),
            &keyid,
            &key,
            &self.state.issuer,
            &self.state.session_lifetime,
        )
        .unwrap();
        format!("{}={}", SESSION_COOKIE, token)
    }
    pub async fn post(&self, author: &User, text: &str) -> Post {
        self.state
            .storage
            .add_post(&author.id(), &PostText::new(text).unwrap(), None, None)
            .await
            .unwrap()
    }
    pub async fn get(&self, path: &str, cookie: Option<&str>) -> Response {
        let mut builder = Request::builder().uri(path);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        self.router
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }
    /// POST `pairs`, urlencoded, to `path`
    pub async fn post_form(
        &self,
        path: &str,
        pairs: &[(&str, &str)],
        cookie: Option<&str>,
    ) -> Response {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        self.router
            .clone()
            .oneshot(builder.body(Body::from(body)).unwrap())
            .await
            .unwrap()
    }
}

impl Site {
    /// POST `parts` as `multipart/form-data` to `path`
    pub async fn post_multipart(
        &self,
        path: &str,
        parts: &[Part<'_>],
        cookie: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method("POST").uri(path).header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        );
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        self.router
            .clone()
            .oneshot(builder.body(Body::from(multipart_body(parts))).unwrap())
            .await
            .unwrap()
    }
    /// Send `request` as-is
    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

pub async fn body(rsp: Response) -> Vec<u8> {
    axum::body::to_bytes(rsp.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn text(rsp: Response) -> String {
    let bytes = axum::body::to_bytes(rsp.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Assert `rsp` is a redirect & return where to
pub fn location(rsp: &Response) -> String {
    assert_eq!(rsp.status(), StatusCode::FOUND);
    rsp.headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned()
}
