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

//! # storage
//!
//! Abstractions for the quill storage layer.
//!
//! [Backend] spells out every permitted style of data access; application code is written against
//! it & a particular implementation is chosen at startup (today, only [sqlite]).
//!
//! [sqlite]: crate::sqlite

use async_trait::async_trait;
use snafu::{Backtrace, IntoError, Snafu};

use crate::entities::{
    Comment, CommentText, CommentView, Group, GroupId, GroupSlug, Post, PostId, PostText, PostView,
    User, UserId, Username,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Storage backend failure: {source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("The group slug {slug} is already in use"))]
    SlugClaimed { slug: GroupSlug, backtrace: Backtrace },
    #[snafu(display("The username {username} is already claimed"))]
    UsernameClaimed {
        username: Username,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        let source: Box<dyn std::error::Error + Send + Sync + 'static> = Box::new(err);
        BackendSnafu.into_error(source)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Which posts a listing should include
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PostFilter {
    /// Every post
    All,
    /// Posts filed under a group
    Group(GroupId),
    /// Posts written by a user
    Author(UserId),
    /// Posts written by anyone the given user follows
    FollowedBy(UserId),
}

/// How an edit should treat a post's image
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ImageChange {
    Keep,
    Replace(String),
    Clear,
}

#[async_trait]
pub trait Backend {
    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Users
    ////////////////////////////////////////////////////////////////////////////////////////////////
    /// Add a new user; fails with [Error::UsernameClaimed] if the name's taken
    async fn add_user(&self, user: &User) -> Result<()>;
    /// Remove a user, along with their posts, comments & follows (in both directions). Returns
    /// false if there was no such user.
    async fn delete_user(&self, id: &UserId) -> Result<bool>;
    /// Retrieve a [User] given a username; None means there is no user by that name.
    async fn user_for_name(&self, name: &Username) -> Result<Option<User>>;

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Groups
    ////////////////////////////////////////////////////////////////////////////////////////////////
    /// Add a new group; fails with [Error::SlugClaimed] if the slug's taken
    async fn add_group(&self, title: &str, slug: &GroupSlug, description: &str) -> Result<Group>;
    async fn group_for_slug(&self, slug: &GroupSlug) -> Result<Option<Group>>;
    /// All groups, ordered by title
    async fn groups(&self) -> Result<Vec<Group>>;

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Posts
    ////////////////////////////////////////////////////////////////////////////////////////////////
    /// Add a post; its publication date will be set to "now"
    async fn add_post(
        &self,
        author: &UserId,
        text: &PostText,
        group: Option<GroupId>,
        image: Option<&str>,
    ) -> Result<Post>;
    /// Update a post's text, group & image; the author & publication date never change. Returns
    /// false if there was no such post.
    async fn update_post(
        &self,
        id: PostId,
        text: &PostText,
        group: Option<GroupId>,
        image: &ImageChange,
    ) -> Result<bool>;
    /// Remove a post (and its comments); returns false if there was no such post
    async fn delete_post(&self, id: PostId) -> Result<bool>;
    async fn post_for_id(&self, id: PostId) -> Result<Option<PostView>>;
    /// Count the posts matching `filter`
    async fn count_posts(&self, filter: &PostFilter) -> Result<usize>;
    /// Retrieve (at most) `limit` posts matching `filter`, newest first, skipping the first
    /// `offset`. Posts published at the same instant are ordered by id, descending.
    async fn posts(&self, filter: &PostFilter, offset: usize, limit: usize)
        -> Result<Vec<PostView>>;

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Comments
    ////////////////////////////////////////////////////////////////////////////////////////////////
    async fn add_comment(
        &self,
        post: PostId,
        author: &UserId,
        text: &CommentText,
    ) -> Result<Comment>;
    /// All comments on `post`, newest first
    async fn comments_for_post(&self, post: PostId) -> Result<Vec<CommentView>>;

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Follows
    ////////////////////////////////////////////////////////////////////////////////////////////////
    /// Record that `user` follows `author` unless they already do (get-or-create); returns true if
    /// a follow was created
    async fn add_follow(&self, user: &UserId, author: &UserId) -> Result<bool>;
    /// Remove any record of `user` following `author`; returns the number of follows removed
    async fn remove_follow(&self, user: &UserId, author: &UserId) -> Result<usize>;
    async fn is_following(&self, user: &UserId, author: &UserId) -> Result<bool>;
    /// Total number of follow records
    async fn count_follows(&self) -> Result<usize>;
}
