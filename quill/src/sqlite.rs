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

//! # sqlite
//!
//! [Storage] implementation for SQLite, by way of [sqlx].
//!
//! [Storage]: crate::storage
//!
//! The schema lives in `migrations/` & is applied every time a [Session] is created. Foreign keys
//! are enforced, which is what makes deleting a user take their posts, comments & follows with
//! them (and deleting a group merely orphan its posts).

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use snafu::{Backtrace, ResultExt, Snafu};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    QueryBuilder, Sqlite, SqlitePool,
};
use tap::Pipe;
use tracing::{debug, info};

use crate::{
    entities::{
        Comment, CommentText, CommentView, Group, GroupId, GroupSlug, Post, PostId, PostText,
        PostView, User, UserId, Username,
    },
    storage::{self, ImageChange, PostFilter, SlugClaimedSnafu, UsernameClaimedSnafu},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to connect to {url}: {source}"))]
    Connect {
        url: String,
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to migrate the database schema: {source}"))]
    Migrate {
        source: sqlx::migrate::MigrateError,
        backtrace: Backtrace,
    },
    #[snafu(display("Invalid SQLite URL {url}: {source}"))]
    Url {
        url: String,
        source: sqlx::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

use storage::Error as StorError;

impl std::convert::From<sqlx::Error> for StorError {
    fn from(value: sqlx::Error) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<std::num::TryFromIntError> for StorError {
    fn from(value: std::num::TryFromIntError) -> Self {
        StorError::new(value)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// The columns of a [PostView], less the `FROM`
const POST_VIEW_SELECT: &str = "SELECT p.id, p.text, p.pub_date, p.author_id, p.group_id, p.image, \
     u.username AS author_username, u.display_name AS author_display_name, \
     g.title AS group_title, g.slug AS group_slug \
     FROM posts p \
     JOIN users u ON u.id = p.author_id \
     LEFT JOIN topic_groups g ON g.id = p.group_id";

/// Append the `WHERE` clause, if any, corresponding to `filter`
fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &PostFilter) {
    match filter {
        PostFilter::All => (),
        PostFilter::Group(id) => {
            builder.push(" WHERE p.group_id = ").push_bind(*id);
        }
        PostFilter::Author(id) => {
            builder.push(" WHERE p.author_id = ").push_bind(*id);
        }
        // A sub-select, rather than a join, so that duplicate follow rows can't duplicate posts
        PostFilter::FollowedBy(id) => {
            builder
                .push(" WHERE p.author_id IN (SELECT author_id FROM follows WHERE user_id = ")
                .push_bind(*id)
                .push(")");
        }
    }
}

/// An SQLite-backed quill datastore
#[derive(Clone, Debug)]
pub struct Session {
    pool: SqlitePool,
}

impl Session {
    /// Connect to the database at `url`, creating it if need be, & bring its schema up-to-date
    ///
    /// An in-memory database (e.g. "sqlite::memory:") exists only as long as its connection, so in
    /// that case the pool is pinned to a single connection that's never retired.
    pub async fn new(url: &str, max_connections: u32) -> Result<Session> {
        let options = SqliteConnectOptions::from_str(url)
            .context(UrlSnafu { url })?
            .create_if_missing(true)
            .foreign_keys(true);
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(5))
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .context(ConnectSnafu { url })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(MigrateSnafu)?;
        info!("Connected to {} & migrated the schema.", url);
        Ok(Session { pool })
    }
    pub async fn close(&self) {
        self.pool.close().await
    }
}

#[async_trait]
impl storage::Backend for Session {
    async fn add_user(&self, user: &User) -> StdResult<(), StorError> {
        match sqlx::query(
            "INSERT INTO users (id, username, display_name, password_hash, pepper_version, joined) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user.id())
        .bind(user.username().as_ref())
        .bind(user.display_name())
        .bind(user.hash().as_ref())
        .bind(user.pepper_version().as_ref())
        .bind(user.joined())
        .execute(&self.pool)
        .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => UsernameClaimedSnafu {
                username: user.username().clone(),
            }
            .fail(),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_user(&self, id: &UserId) -> StdResult<bool, StorError> {
        Ok(sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(*id)
            .execute(&self.pool)
            .await?
            .rows_affected()
            > 0)
    }

    async fn user_for_name(&self, name: &Username) -> StdResult<Option<User>, StorError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
            .bind(name.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .pipe(Ok)
    }

    async fn add_group(
        &self,
        title: &str,
        slug: &GroupSlug,
        description: &str,
    ) -> StdResult<Group, StorError> {
        match sqlx::query_as::<_, Group>(
            "INSERT INTO topic_groups (title, slug, description) VALUES (?, ?, ?) RETURNING *",
        )
        .bind(title)
        .bind(slug.as_ref())
        .bind(description)
        .fetch_one(&self.pool)
        .await
        {
            Ok(group) => Ok(group),
            Err(err) if is_unique_violation(&err) => SlugClaimedSnafu { slug: slug.clone() }.fail(),
            Err(err) => Err(err.into()),
        }
    }

    async fn group_for_slug(&self, slug: &GroupSlug) -> StdResult<Option<Group>, StorError> {
        sqlx::query_as::<_, Group>("SELECT * FROM topic_groups WHERE slug = ?")
            .bind(slug.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .pipe(Ok)
    }

    async fn groups(&self) -> StdResult<Vec<Group>, StorError> {
        sqlx::query_as::<_, Group>("SELECT * FROM topic_groups ORDER BY title, id")
            .fetch_all(&self.pool)
            .await?
            .pipe(Ok)
    }

    async fn add_post(
        &self,
        author: &UserId,
        text: &PostText,
        group: Option<GroupId>,
        image: Option<&str>,
    ) -> StdResult<Post, StorError> {
        sqlx::query_as::<_, Post>(
            "INSERT INTO posts (text, pub_date, author_id, group_id, image) \
             VALUES (?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(text.as_ref())
        .bind(Utc::now())
        .bind(*author)
        .bind(group)
        .bind(image)
        .fetch_one(&self.pool)
        .await?
        .pipe(Ok)
    }

    async fn update_post(
        &self,
        id: PostId,
        text: &PostText,
        group: Option<GroupId>,
        image: &ImageChange,
    ) -> StdResult<bool, StorError> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE posts SET text = ");
        builder.push_bind(text.as_ref());
        builder.push(", group_id = ").push_bind(group);
        match image {
            ImageChange::Keep => (),
            ImageChange::Replace(path) => {
                builder.push(", image = ").push_bind(path.clone());
            }
            ImageChange::Clear => {
                builder.push(", image = NULL");
            }
        }
        builder.push(" WHERE id = ").push_bind(id);
        Ok(builder.build().execute(&self.pool).await?.rows_affected() > 0)
    }

    async fn delete_post(&self, id: PostId) -> StdResult<bool, StorError> {
        Ok(sqlx::query("DELETE FROM posts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected()
            > 0)
    }

    async fn post_for_id(&self, id: PostId) -> StdResult<Option<PostView>, StorError> {
        let mut builder = QueryBuilder::<Sqlite>::new(POST_VIEW_SELECT);
        builder.push(" WHERE p.id = ").push_bind(id);
        builder
            .build_query_as::<PostView>()
            .fetch_optional(&self.pool)
            .await?
            .pipe(Ok)
    }

    async fn count_posts(&self, filter: &PostFilter) -> StdResult<usize, StorError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM posts p");
        push_filter(&mut builder, filter);
        let count: i64 = builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count)?)
    }

    async fn posts(
        &self,
        filter: &PostFilter,
        offset: usize,
        limit: usize,
    ) -> StdResult<Vec<PostView>, StorError> {
        let mut builder = QueryBuilder::<Sqlite>::new(POST_VIEW_SELECT);
        push_filter(&mut builder, filter);
        builder
            .push(" ORDER BY p.pub_date DESC, p.id DESC LIMIT ")
            .push_bind(i64::try_from(limit)?)
            .push(" OFFSET ")
            .push_bind(i64::try_from(offset)?);
        builder
            .build_query_as::<PostView>()
            .fetch_all(&self.pool)
            .await?
            .pipe(Ok)
    }

    async fn add_comment(
        &self,
        post: PostId,
        author: &UserId,
        text: &CommentText,
    ) -> StdResult<Comment, StorError> {
        sqlx::query_as::<_, Comment>(
            "INSERT INTO comments (post_id, author_id, text, created) VALUES (?, ?, ?, ?) \
             RETURNING *",
        )
        .bind(post)
        .bind(*author)
        .bind(text.as_ref())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?
        .pipe(Ok)
    }

    async fn comments_for_post(&self, post: PostId) -> StdResult<Vec<CommentView>, StorError> {
        sqlx::query_as::<_, CommentView>(
            "SELECT c.id, c.post_id, c.author_id, c.text, c.created, u.username AS author_username \
             FROM comments c JOIN users u ON u.id = c.author_id \
             WHERE c.post_id = ? ORDER BY c.created DESC, c.id DESC",
        )
        .bind(post)
        .fetch_all(&self.pool)
        .await?
        .pipe(Ok)
    }

    async fn add_follow(&self, user: &UserId, author: &UserId) -> StdResult<bool, StorError> {
        let mut tx = self.pool.begin().await?;
        let extant: Option<i64> =
            sqlx::query_scalar("SELECT id FROM follows WHERE user_id = ? AND author_id = ? LIMIT 1")
                .bind(*user)
                .bind(*author)
                .fetch_optional(&mut *tx)
                .await?;
        let created = if extant.is_none() {
            sqlx::query("INSERT INTO follows (user_id, author_id) VALUES (?, ?)")
                .bind(*user)
                .bind(*author)
                .execute(&mut *tx)
                .await?;
            true
        } else {
            false
        };
        tx.commit().await?;
        debug!("add_follow({user}, {author}): created={created}");
        Ok(created)
    }

    async fn remove_follow(&self, user: &UserId, author: &UserId) -> StdResult<usize, StorError> {
        let removed = sqlx::query("DELETE FROM follows WHERE user_id = ? AND author_id = ?")
            .bind(*user)
            .bind(*author)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(usize::try_from(removed)?)
    }

    async fn is_following(&self, user: &UserId, author: &UserId) -> StdResult<bool, StorError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT id FROM follows WHERE user_id = ? AND author_id = ? LIMIT 1")
                .bind(*user)
                .bind(*author)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn count_follows(&self) -> StdResult<usize, StorError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM follows")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count)?)
    }
}
