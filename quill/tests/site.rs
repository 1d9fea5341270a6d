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

//! Drive the quill site end-to-end: feeds, pagination, the page cache, posting, editing, comments
//! & follows.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};

use common::{body, location, site, text, Part, PNG};
use quill::{
    entities::{GroupSlug, PostId},
    storage::PostFilter,
};

#[tokio::test]
async fn unknown_things_are_not_found() {
    let site = site().await;

    let rsp = site.get("/", None).await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert!(text(rsp).await.contains("Latest posts"));

    for path in [
        "/no/such/page/",
        "/posts/999/",
        "/posts/not-a-number/",
        "/group/nope/",
        "/profile/nobody/",
    ] {
        let rsp = site.get(path, None).await;
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND, "{}", path);
        assert!(text(rsp).await.contains("Page not found"), "{}", path);
    }
}

#[tokio::test]
async fn guests_are_sent_to_login() {
    let site = site().await;
    let alice = site.user("alice", "Alice").await;
    let post = site.post(&alice, "Hello").await;

    assert_eq!(
        location(&site.get("/create/", None).await),
        "/auth/login/?next=%2Fcreate%2F"
    );
    assert_eq!(
        location(&site.get("/follow/", None).await),
        "/auth/login/?next=%2Ffollow%2F"
    );
    let edit = format!("/posts/{}/edit/", post.id());
    assert_eq!(
        location(&site.get(&edit, None).await),
        format!("/auth/login/?next=%2Fposts%2F{}%2Fedit%2F", post.id())
    );
    // Nothing was written on the guest's behalf
    let rsp = site
        .post_form(&format!("/posts/{}/comment/", post.id()), &[("text", "hi")], None)
        .await;
    assert!(location(&rsp).starts_with("/auth/login/"));
    assert!(site
        .state
        .storage
        .comments_for_post(post.id())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn feeds_are_paginated() {
    let site = site().await;
    let alice = site.user("alice", "Alice").await;
    for i in 1..=13 {
        site.post(&alice, &format!("Entry {:02}", i)).await;
    }

    let first = text(site.get("/", None).await).await;
    assert_eq!(first.matches("<article>").count(), 10);
    // Newest first
    assert!(first.contains("Entry 13"));
    assert!(first.contains("Entry 04"));
    assert!(!first.contains("Entry 03"));

    let second = text(site.get("/?page=2", None).await).await;
    assert_eq!(second.matches("<article>").count(), 3);
    assert!(second.contains("Entry 01"));

    // Out-of-range page numbers are clamped; nonsense means page one
    let last = text(site.get("/?page=99", None).await).await;
    assert_eq!(last.matches("<article>").count(), 3);
    let huge = text(site.get("/?page=99999999999999999999", None).await).await;
    assert_eq!(huge.matches("<article>").count(), 3);
    let nonsense = text(site.get("/?page=last", None).await).await;
    assert_eq!(nonsense.matches("<article>").count(), 10);

    let profile = text(site.get("/profile/alice/?page=2", None).await).await;
    assert_eq!(profile.matches("<article>").count(), 3);
    assert!(profile.contains("Posts: 13"));
}

#[tokio::test]
async fn the_front_page_is_cached() {
    let site = site().await;
    let alice = site.user("alice", "Alice").await;
    let post = site.post(&alice, "Soon to be gone").await;

    assert!(text(site.get("/", None).await)
        .await
        .contains("Soon to be gone"));
    assert!(site.state.storage.delete_post(post.id()).await.unwrap());

    // Still served from the cache...
    assert!(text(site.get("/", None).await)
        .await
        .contains("Soon to be gone"));
    // but not elsewhere,
    let rsp = site.get(&format!("/posts/{}/", post.id()), None).await;
    assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
    // & not once the cache is emptied.
    site.state.page_cache.clear().await;
    assert!(!text(site.get("/", None).await)
        .await
        .contains("Soon to be gone"));
    assert!(site.state.instruments.counter_value("cache.pages.hits").unwrap() >= 1);
}

#[tokio::test]
async fn posting_and_editing() {
    let site = site().await;
    let alice = site.user("alice", "Alice").await;
    let bob = site.user("bob", "Bob").await;
    let alice_cookie = site.cookie(&alice);
    let bob_cookie = site.cookie(&bob);
    let group = site
        .state
        .storage
        .add_group("Rust", &GroupSlug::new("rust").unwrap(), "All things Rust")
        .await
        .unwrap();

    let rsp = site.get("/create/", Some(&alice_cookie)).await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert!(text(rsp).await.contains(">Rust</option>"));

    // A blank post is refused, & the form re-rendered
    let rsp = site
        .post_form("/create/", &[("text", "  "), ("group", "")], Some(&alice_cookie))
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert!(text(rsp).await.contains("This field is required."));

    // As is a group that doesn't exist
    let rsp = site
        .post_form(
            "/create/",
            &[("text", "Lost"), ("group", "4242")],
            Some(&alice_cookie),
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert!(text(rsp).await.contains("Select a valid choice."));
    assert_eq!(site.state.storage.count_posts(&PostFilter::All).await.unwrap(), 0);

    let group_id = group.id().to_string();
    let rsp = site
        .post_form(
            "/create/",
            &[("text", "Borrowing is fun"), ("group", &group_id)],
            Some(&alice_cookie),
        )
        .await;
    assert_eq!(location(&rsp), "/profile/alice/");
    let posts = site
        .state
        .storage
        .posts(&PostFilter::Group(group.id()), 0, 10)
        .await
        .unwrap();
    assert_eq!(posts.len(), 1);
    let id = posts[0].post().id();
    assert_eq!(posts[0].post().text(), "Borrowing is fun");
    assert!(text(site.get("/group/rust/", None).await)
        .await
        .contains("Borrowing is fun"));

    // Only the author may edit; anyone else is sent back to the post
    let edit = format!("/posts/{}/edit/", id);
    assert_eq!(
        location(&site.get(&edit, Some(&bob_cookie)).await),
        format!("/posts/{}/", id)
    );
    let rsp = site
        .post_form(&edit, &[("text", "Vandalized"), ("group", "")], Some(&bob_cookie))
        .await;
    assert_eq!(location(&rsp), format!("/posts/{}/", id));
    // Whatever the body
    let rsp = site
        .send(
            Request::builder()
                .method("POST")
                .uri(&edit)
                .header("cookie", &bob_cookie)
                .body(Body::from("not a form"))
                .unwrap(),
        )
        .await;
    assert_eq!(location(&rsp), format!("/posts/{}/", id));
    assert_eq!(
        site.state.storage.post_for_id(id).await.unwrap().unwrap().post().text(),
        "Borrowing is fun"
    );

    let rsp = site.get(&edit, Some(&alice_cookie)).await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert!(text(rsp).await.contains("Borrowing is fun"));

    let rsp = site
        .post_form(
            &edit,
            &[("text", "Borrowing is very fun"), ("group", "")],
            Some(&alice_cookie),
        )
        .await;
    assert_eq!(location(&rsp), format!("/posts/{}/", id));
    let edited = site.state.storage.post_for_id(id).await.unwrap().unwrap();
    assert_eq!(edited.post().text(), "Borrowing is very fun");
    assert_eq!(edited.post().group(), None);
    assert_eq!(edited.post().pub_date(), posts[0].post().pub_date());
    assert_eq!(edited.post().author(), alice.id());

    // Editing a post that isn't there
    let rsp = site.get("/posts/999/edit/", Some(&alice_cookie)).await;
    assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn empty_group() {
    let site = site().await;
    site.state
        .storage
        .add_group("Quiet", &GroupSlug::new("quiet").unwrap(), "Nothing here")
        .await
        .unwrap();
    let rsp = site.get("/group/quiet/", None).await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert!(text(rsp).await.contains("No posts in this group yet."));
}

#[tokio::test]
async fn comments() {
    let site = site().await;
    let alice = site.user("alice", "Alice").await;
    let bob = site.user("bob", "Bob").await;
    let bob_cookie = site.cookie(&bob);
    let post = site.post(&alice, "Comment on me").await;
    let path = format!("/posts/{}/comment/", post.id());
    let detail = format!("/posts/{}/", post.id());

    assert_eq!(location(&site.get(&path, Some(&bob_cookie)).await), detail);

    let rsp = site
        .post_form(&path, &[("text", "Nice post")], Some(&bob_cookie))
        .await;
    assert_eq!(location(&rsp), detail);
    // Blank comments are dropped silently
    let rsp = site
        .post_form(&path, &[("text", "   ")], Some(&bob_cookie))
        .await;
    assert_eq!(location(&rsp), detail);

    let comments = site.state.storage.comments_for_post(post.id()).await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].comment().text(), "Nice post");
    assert_eq!(comments[0].author_username().as_ref(), "bob");

    let rsp = site.get(&detail, None).await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert!(text(rsp).await.contains("Nice post"));

    let rsp = site
        .post_form(
            &format!("/posts/{}/comment/", PostId::new(999)),
            &[("text", "Into the void")],
            Some(&bob_cookie),
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn following() {
    let site = site().await;
    let alice = site.user("alice", "Alice").await;
    let bob = site.user("bob", "Bob").await;
    let bob_cookie = site.cookie(&bob);
    site.post(&alice, "Alice writes").await;
    site.post(&bob, "Bob writes").await;

    let feed = text(site.get("/follow/", Some(&bob_cookie)).await).await;
    assert!(!feed.contains("Alice writes"));

    for _ in 0..2 {
        let rsp = site.get("/profile/alice/follow/", Some(&bob_cookie)).await;
        assert_eq!(location(&rsp), "/profile/alice/");
    }
    assert_eq!(site.state.storage.count_follows().await.unwrap(), 1);
    assert!(site
        .state
        .storage
        .is_following(&bob.id(), &alice.id())
        .await
        .unwrap());

    let feed = text(site.get("/follow/", Some(&bob_cookie)).await).await;
    assert!(feed.contains("Alice writes"));
    assert!(!feed.contains("Bob writes"));

    let profile = text(site.get("/profile/alice/", Some(&bob_cookie)).await).await;
    assert!(profile.contains("Unfollow"));

    // Following oneself is a no-op
    let rsp = site.get("/profile/bob/follow/", Some(&bob_cookie)).await;
    assert_eq!(location(&rsp), "/profile/bob/");
    assert_eq!(site.state.storage.count_follows().await.unwrap(), 1);

    let rsp = site.get("/profile/alice/unfollow/", Some(&bob_cookie)).await;
    assert_eq!(location(&rsp), "/profile/alice/");
    assert_eq!(site.state.storage.count_follows().await.unwrap(), 0);
    // Un-following again changes nothing
    let rsp = site.get("/profile/alice/unfollow/", Some(&bob_cookie)).await;
    assert_eq!(location(&rsp), "/profile/alice/");

    let rsp = site.get("/profile/nobody/follow/", Some(&bob_cookie)).await;
    assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn multipart_images() {
    let site = site().await;
    let alice = site.user("alice", "Alice").await;
    let cookie = site.cookie(&alice);

    let rsp = site
        .post_multipart(
            "/create/",
            &[
                Part::Text("text", "With a cat"),
                Part::Text("group", ""),
                Part::File("image", "cat.png", PNG),
            ],
            Some(&cookie),
        )
        .await;
    assert_eq!(location(&rsp), "/profile/alice/");
    let posts = site
        .state
        .storage
        .posts(&PostFilter::Author(alice.id()), 0, 10)
        .await
        .unwrap();
    assert_eq!(posts.len(), 1);
    let id = posts[0].post().id();
    assert_eq!(posts[0].post().image(), Some("posts/cat.png"));

    let rsp = site.get("/media/posts/cat.png", None).await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(body(rsp).await, PNG);

    // Anything that isn't an image is refused
    let rsp = site
        .post_multipart(
            "/create/",
            &[
                Part::Text("text", "Not a cat"),
                Part::File("image", "notes.png", b"just some text, honest"),
            ],
            Some(&cookie),
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert!(text(rsp).await.contains("Upload a valid image."));
    assert_eq!(
        site.state
            .storage
            .count_posts(&PostFilter::Author(alice.id()))
            .await
            .unwrap(),
        1
    );

    // No upload (& an empty file part, as browsers send) keeps the image
    let edit = format!("/posts/{}/edit/", id);
    let rsp = site
        .post_multipart(
            &edit,
            &[
                Part::Text("text", "Still a cat"),
                Part::Text("group", ""),
                Part::File("image", "", b""),
            ],
            Some(&cookie),
        )
        .await;
    assert_eq!(location(&rsp), format!("/posts/{}/", id));
    let post = site.state.storage.post_for_id(id).await.unwrap().unwrap();
    assert_eq!(post.post().text(), "Still a cat");
    assert_eq!(post.post().image(), Some("posts/cat.png"));

    let rsp = site
        .post_multipart(
            &edit,
            &[
                Part::Text("text", "No cat"),
                Part::Text("group", ""),
                Part::Text("image-clear", "on"),
            ],
            Some(&cookie),
        )
        .await;
    assert_eq!(location(&rsp), format!("/posts/{}/", id));
    let post = site.state.storage.post_for_id(id).await.unwrap().unwrap();
    assert_eq!(post.post().image(), None);

    let rsp = site
        .post_multipart(
            &edit,
            &[
                Part::Text("text", "A dog now"),
                Part::File("image", "dog.png", PNG),
            ],
            Some(&cookie),
        )
        .await;
    assert_eq!(location(&rsp), format!("/posts/{}/", id));
    let post = site.state.storage.post_for_id(id).await.unwrap().unwrap();
    assert_eq!(post.post().image(), Some("posts/dog.png"));
}
