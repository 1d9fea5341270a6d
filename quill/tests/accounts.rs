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

//! Sign-up, login & logout through the site.

mod common;

use axum::http::{header, StatusCode};

use common::{location, site, text, PASSWORD};
use quill::{
    authn::SESSION_COOKIE,
    entities::Username,
    users::{INVALID_LOGIN, PASSWORD_MISMATCH, USERNAME_TAKEN},
};

fn session_cookie(rsp: &axum::response::Response) -> Option<String> {
    rsp.headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.starts_with(&format!("{}=", SESSION_COOKIE)))
        .map(|value| value.split(';').next().unwrap_or_default().to_owned())
}

#[tokio::test]
async fn signup() {
    let site = site().await;

    let rsp = site.get("/auth/signup/", None).await;
    assert_eq!(rsp.status(), StatusCode::OK);

    let rsp = site
        .post_form(
            "/auth/signup/",
            &[
                ("username", "carol"),
                ("display_name", "Carol"),
                ("password1", PASSWORD),
                ("password2", PASSWORD),
            ],
            None,
        )
        .await;
    assert_eq!(location(&rsp), "/");
    let cookie = session_cookie(&rsp).unwrap();
    let carol = site
        .state
        .storage
        .user_for_name(&Username::new("carol").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(carol.display_name(), "Carol");

    // The new session works
    let rsp = site.get("/create/", Some(&cookie)).await;
    assert_eq!(rsp.status(), StatusCode::OK);

    let rsp = site
        .post_form(
            "/auth/signup/",
            &[
                ("username", "carol"),
                ("display_name", "Another Carol"),
                ("password1", PASSWORD),
                ("password2", PASSWORD),
            ],
            None,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert!(session_cookie(&rsp).is_none());
    assert!(text(rsp).await.contains(USERNAME_TAKEN));

    let rsp = site
        .post_form(
            "/auth/signup/",
            &[
                ("username", "dave"),
                ("password1", PASSWORD),
                ("password2", "something else"),
            ],
            None,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    // Tera escapes the apostrophe
    assert!(text(rsp).await.contains(&PASSWORD_MISMATCH.replace('\'', "&#x27;")));

    let rsp = site
        .post_form(
            "/auth/signup/",
            &[("username", "dave"), ("password1", "password"), ("password2", "password")],
            None,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert!(text(rsp).await.contains("This password is too weak."));
    assert!(site
        .state
        .storage
        .user_for_name(&Username::new("dave").unwrap())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn login_and_logout() {
    let site = site().await;
    site.user("alice", "Alice").await;

    let rsp = site.get("/auth/login/?next=%2Ffollow%2F", None).await;
    assert_eq!(rsp.status(), StatusCode::OK);

    let rsp = site
        .post_form(
            "/auth/login/",
            &[("username", "alice"), ("password", "not my password")],
            None,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert!(session_cookie(&rsp).is_none());
    assert!(text(rsp).await.contains("Please enter a correct username and password."));
    assert!(INVALID_LOGIN.starts_with("Please enter a correct username and password."));

    let rsp = site
        .post_form(
            "/auth/login/",
            &[("username", "nobody"), ("password", PASSWORD)],
            None,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert!(session_cookie(&rsp).is_none());

    let rsp = site
        .post_form(
            "/auth/login/",
            &[("username", "alice"), ("password", PASSWORD), ("next", "/follow/")],
            None,
        )
        .await;
    assert_eq!(location(&rsp), "/follow/");
    let cookie = session_cookie(&rsp).unwrap();
    assert_eq!(site.get("/follow/", Some(&cookie)).await.status(), StatusCode::OK);

    // Off-site destinations are ignored
    let rsp = site
        .post_form(
            "/auth/login/",
            &[
                ("username", "alice"),
                ("password", PASSWORD),
                ("next", "//evil.example.com/"),
            ],
            None,
        )
        .await;
    assert_eq!(location(&rsp), "/");

    let rsp = site.post_form("/auth/logout/", &[], Some(&cookie)).await;
    assert_eq!(location(&rsp), "/");
    let removal = rsp
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.starts_with(&format!("{}=", SESSION_COOKIE)))
        .unwrap()
        .to_owned();
    assert!(removal.contains("Max-Age=0") || removal.contains("Expires="));
}

#[tokio::test]
async fn bad_session_cookies_are_ignored() {
    let site = site().await;
    let cookie = format!("{}=not.a.token", SESSION_COOKIE);
    assert_eq!(site.get("/", Some(&cookie)).await.status(), StatusCode::OK);
    assert!(location(&site.get("/follow/", Some(&cookie)).await).starts_with("/auth/login/"));
    assert_eq!(
        site.state
            .instruments
            .counter_value("session.auth.failures"),
        Some(2)
    );
}
