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

//! # quill posts
//!
//! The heart of the site: the feeds (global, per-group, per-author & "authors I follow"), the post
//! detail page, the create & edit forms, comments, and following & un-following authors.
//!
//! Handlers follow a common shape: an inner `...1()` function does the work, returning a
//! [Result], & the handler proper maps that onto a response (logging & counting along the way).
//! Missing things (groups, users, posts) are reported as [Error::NotFound], which becomes the
//! themed 404 page.

use std::sync::Arc;

use axum::{
    extract::{rejection::FormRejection, rejection::PathRejection, rejection::QueryRejection},
    extract::{FromRequest, Path, Query, Request, State},
    http::{StatusCode, Uri},
    response::Response,
    routing::get,
    Extension, Form, Router,
};
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::{debug, error, info};

use crate::{
    authn::{require_login, Viewer},
    cache::cache_page,
    counter_add,
    entities::{
        CommentText, CommentView, Group, GroupId, GroupSlug, PostId, PostView, User, Username,
    },
    forms::{CommentForm, FormErrors, PostSubmission, ValidPost},
    http::{found, internal_error_page, not_found_page, page, render},
    media,
    metrics::{self, Sort},
    pagination::{Page, PageQuery, Window},
    quill::Quill,
    storage::{self, ImageChange, PostFilter},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to read or write comments: {source}"))]
    Comments {
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read or write follows: {source}"))]
    Follows {
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read groups: {source}"))]
    Groups {
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to save an image: {source}"))]
    Media {
        source: media::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Nothing at {path}"))]
    NotFound { path: String },
    #[snafu(display("Failed to read or write posts: {source}"))]
    Posts {
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to look up a user: {source}"))]
    Users {
        source: storage::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

inventory::submit! { metrics::Registration::new("posts.listings.served", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("posts.details.served", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("posts.created", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("posts.edited", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("posts.edits.refused", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("posts.forms.invalid", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("posts.comments.added", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("posts.comments.ignored", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("posts.follows.added", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("posts.follows.removed", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("posts.errors", Sort::IntegralCounter) }

/// Map a failed handler onto the appropriate error page
fn error_response(state: &Quill, viewer: Option<&User>, err: Error) -> Response {
    match err {
        Error::NotFound { path } => {
            debug!("Not found: {}", path);
            not_found_page(state, viewer, &path)
        }
        err => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "posts.errors", 1);
            internal_error_page(state, viewer)
        }
    }
}

fn profile_path(username: &Username) -> String {
    format!("/profile/{}/", username)
}

fn post_path(id: PostId) -> String {
    format!("/posts/{}/", id)
}

/// Resolve a path segment naming a post; anything that isn't a post id is simply not found
fn post_id(id: StdResult<Path<PostId>, PathRejection>, uri: &Uri) -> Result<PostId> {
    id.map(|Path(id)| id).map_err(|_| Error::NotFound {
        path: uri.path().to_owned(),
    })
}

async fn find_post(state: &Quill, id: PostId, uri: &Uri) -> Result<PostView> {
    state
        .storage
        .post_for_id(id)
        .await
        .context(PostsSnafu)?
        .ok_or_else(|| Error::NotFound {
            path: uri.path().to_owned(),
        })
}

async fn find_author(state: &Quill, username: &str, uri: &Uri) -> Result<User> {
    let not_found = || Error::NotFound {
        path: uri.path().to_owned(),
    };
    let username = Username::new(username).map_err(|_| not_found())?;
    state
        .storage
        .user_for_name(&username)
        .await
        .context(UsersSnafu)?
        .ok_or_else(not_found)
}

/// Select one page of the posts matching `filter`
async fn listing(
    state: &Quill,
    filter: &PostFilter,
    query: StdResult<Query<PageQuery>, QueryRejection>,
) -> Result<Page<PostView>> {
    let query = query.map(|Query(q)| q).unwrap_or_default();
    let count = state
        .storage
        .count_posts(filter)
        .await
        .context(PostsSnafu)?;
    let window = Window::new(query.page.as_deref(), count, state.page_size);
    let posts = state
        .storage
        .posts(filter, window.offset(), window.limit())
        .await
        .context(PostsSnafu)?;
    Ok(Page::new(&window, posts))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Feeds                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// `GET /`: every post, newest first
async fn index(
    State(state): State<Arc<Quill>>,
    viewer: Viewer,
    query: StdResult<Query<PageQuery>, QueryRejection>,
) -> Response {
    match listing(&state, &PostFilter::All, query).await {
        Ok(posts) => {
            counter_add!(state.instruments, "posts.listings.served", 1);
            let mut context = tera::Context::new();
            context.insert("page", &posts);
            page(&state, viewer.user(), "index.html", context)
        }
        Err(err) => error_response(&state, viewer.user(), err),
    }
}

/// `GET /group/{slug}/`: the posts in one group
async fn group_posts(
    State(state): State<Arc<Quill>>,
    viewer: Viewer,
    Path(slug): Path<String>,
    uri: Uri,
    query: StdResult<Query<PageQuery>, QueryRejection>,
) -> Response {
    async fn group_posts1(
        state: &Quill,
        slug: &str,
        uri: &Uri,
        query: StdResult<Query<PageQuery>, QueryRejection>,
    ) -> Result<(Group, Page<PostView>)> {
        let not_found = || Error::NotFound {
            path: uri.path().to_owned(),
        };
        let slug = GroupSlug::new(slug).map_err(|_| not_found())?;
        let group = state
            .storage
            .group_for_slug(&slug)
            .await
            .context(GroupsSnafu)?
            .ok_or_else(not_found)?;
        let posts = listing(state, &PostFilter::Group(group.id()), query).await?;
        Ok((group, posts))
    }

    match group_posts1(&state, &slug, &uri, query).await {
        Ok((group, posts)) => {
            counter_add!(state.instruments, "posts.listings.served", 1);
            let mut context = tera::Context::new();
            context.insert("group", &group);
            context.insert("page", &posts);
            page(&state, viewer.user(), "group_list.html", context)
        }
        Err(err) => error_response(&state, viewer.user(), err),
    }
}

/// `GET /profile/{username}/`: one author's posts, along with whether the viewer follows them
async fn profile(
    State(state): State<Arc<Quill>>,
    viewer: Viewer,
    Path(username): Path<String>,
    uri: Uri,
    query: StdResult<Query<PageQuery>, QueryRejection>,
) -> Response {
    async fn profile1(
        state: &Quill,
        viewer: Option<&User>,
        username: &str,
        uri: &Uri,
        query: StdResult<Query<PageQuery>, QueryRejection>,
    ) -> Result<(User, Page<PostView>, bool)> {
        let author = find_author(state, username, uri).await?;
        let posts = listing(state, &PostFilter::Author(author.id()), query).await?;
        let following = match viewer {
            Some(viewer) if viewer.id() != author.id() => state
                .storage
                .is_following(&viewer.id(), &author.id())
                .await
                .context(FollowsSnafu)?,
            _ => false,
        };
        Ok((author, posts, following))
    }

    match profile1(&state, viewer.user(), &username, &uri, query).await {
        Ok((author, posts, following)) => {
            counter_add!(state.instruments, "posts.listings.served", 1);
            let mut context = tera::Context::new();
            context.insert(
                "is_self",
                &viewer.user().map(|v| v.id() == author.id()).unwrap_or(false),
            );
            context.insert("author", &author);
            context.insert("post_count", &posts.count);
            context.insert("page", &posts);
            context.insert("following", &following);
            page(&state, viewer.user(), "profile.html", context)
        }
        Err(err) => error_response(&state, viewer.user(), err),
    }
}

/// `GET /follow/`: posts by every author the viewer follows
async fn follow_index(
    State(state): State<Arc<Quill>>,
    Extension(user): Extension<User>,
    query: StdResult<Query<PageQuery>, QueryRejection>,
) -> Response {
    match listing(&state, &PostFilter::FollowedBy(user.id()), query).await {
        Ok(posts) => {
            counter_add!(state.instruments, "posts.listings.served", 1);
            let mut context = tera::Context::new();
            context.insert("page", &posts);
            page(&state, Some(&user), "follow.html", context)
        }
        Err(err) => error_response(&state, Some(&user), err),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Post detail                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// `GET /posts/{id}/`: a post, its comments & (for logged-in viewers) a comment form
async fn post_detail(
    State(state): State<Arc<Quill>>,
    viewer: Viewer,
    id: StdResult<Path<PostId>, PathRejection>,
    uri: Uri,
) -> Response {
    async fn post_detail1(
        state: &Quill,
        id: StdResult<Path<PostId>, PathRejection>,
        uri: &Uri,
    ) -> Result<(PostView, Vec<CommentView>, usize)> {
        let post = find_post(state, post_id(id, uri)?, uri).await?;
        let comments = state
            .storage
            .comments_for_post(post.post().id())
            .await
            .context(CommentsSnafu)?;
        let post_count = state
            .storage
            .count_posts(&PostFilter::Author(post.post().author()))
            .await
            .context(PostsSnafu)?;
        Ok((post, comments, post_count))
    }

    match post_detail1(&state, id, &uri).await {
        Ok((post, comments, post_count)) => {
            counter_add!(state.instruments, "posts.details.served", 1);
            let mut context = tera::Context::new();
            context.insert(
                "can_edit",
                &viewer
                    .user()
                    .map(|v| v.id() == post.post().author())
                    .unwrap_or(false),
            );
            context.insert("post", &post);
            context.insert("comments", &comments);
            context.insert("post_count", &post_count);
            page(&state, viewer.user(), "post_detail.html", context)
        }
        Err(err) => error_response(&state, viewer.user(), err),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       Create & edit                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// What the post form needs to render itself
struct PostFormState<'a> {
    post_id: Option<PostId>,
    text: &'a str,
    selected_group: Option<i64>,
    image: Option<&'a str>,
    errors: &'a FormErrors,
}

fn render_post_form(
    state: &Quill,
    user: &User,
    groups: &[Group],
    form: PostFormState<'_>,
) -> Response {
    let mut context = tera::Context::new();
    context.insert("is_edit", &form.post_id.is_some());
    context.insert("post_id", &form.post_id);
    context.insert("text", form.text);
    context.insert("selected_group", &form.selected_group);
    context.insert("image", &form.image);
    context.insert("errors", form.errors);
    context.insert("groups", groups);
    render(state, Some(user), StatusCode::OK, "create_post.html", context)
}

/// The outcome of a post form submission
enum Submitted {
    Saved(String),
    Invalid {
        groups: Vec<Group>,
        text: String,
        group: Option<i64>,
        image: Option<String>,
        errors: FormErrors,
    },
}

/// Check `submission`; return the validated post, or what's needed to re-render the form
async fn check_submission(
    state: &Quill,
    submission: PostSubmission,
    image: Option<&str>,
) -> Result<StdResult<ValidPost, Submitted>> {
    let groups = state.storage.groups().await.context(GroupsSnafu)?;
    let ids: Vec<GroupId> = groups.iter().map(Group::id).collect();
    let text = submission.text.clone();
    let group = submission.group.trim().parse::<i64>().ok();
    Ok(submission.validate(&ids).map_err(|errors| Submitted::Invalid {
        groups,
        text,
        group,
        image: image.map(str::to_owned),
        errors,
    }))
}

fn submitted_response(
    state: &Quill,
    user: &User,
    post_id: Option<PostId>,
    result: Result<Submitted>,
) -> Response {
    match result {
        Ok(Submitted::Saved(location)) => found(&location),
        Ok(Submitted::Invalid {
            groups,
            text,
            group,
            image,
            errors,
        }) => {
            debug!("Invalid post form: {:?}", errors);
            counter_add!(state.instruments, "posts.forms.invalid", 1);
            render_post_form(
                state,
                user,
                &groups,
                PostFormState {
                    post_id,
                    text: &text,
                    selected_group: group,
                    image: image.as_deref(),
                    errors: &errors,
                },
            )
        }
        Err(err) => error_response(state, Some(user), err),
    }
}

/// `GET /create/`: a blank post form
async fn create_form(State(state): State<Arc<Quill>>, Extension(user): Extension<User>) -> Response {
    match state.storage.groups().await.context(GroupsSnafu) {
        Ok(groups) => render_post_form(
            &state,
            &user,
            &groups,
            PostFormState {
                post_id: None,
                text: "",
                selected_group: None,
                image: None,
                errors: &FormErrors::default(),
            },
        ),
        Err(err) => error_response(&state, Some(&user), err),
    }
}

/// `POST /create/`: publish a new post as the viewer, then show them their profile
async fn create_post(
    State(state): State<Arc<Quill>>,
    Extension(user): Extension<User>,
    submission: PostSubmission,
) -> Response {
    async fn create_post1(
        state: &Quill,
        user: &User,
        submission: PostSubmission,
    ) -> Result<Submitted> {
        let valid = match check_submission(state, submission, None).await? {
            Ok(valid) => valid,
            Err(invalid) => return Ok(invalid),
        };
        let image = match &valid.image {
            Some(upload) => Some(
                state
                    .media
                    .save_post_image(upload)
                    .await
                    .context(MediaSnafu)?,
            ),
            None => None,
        };
        let post = state
            .storage
            .add_post(&user.id(), &valid.text, valid.group, image.as_deref())
            .await
            .context(PostsSnafu)?;
        info!("{} published post {}", user.username(), post.id());
        counter_add!(state.instruments, "posts.created", 1);
        Ok(Submitted::Saved(profile_path(user.username())))
    }

    let result = create_post1(&state, &user, submission).await;
    submitted_response(&state, &user, None, result)
}

/// The post `id`, provided `user` wrote it; otherwise, the response to send
async fn authored_post(
    state: &Quill,
    user: &User,
    id: StdResult<Path<PostId>, PathRejection>,
    uri: &Uri,
) -> StdResult<PostView, Response> {
    let post = match post_id(id, uri) {
        Ok(id) => find_post(state, id, uri).await,
        Err(err) => Err(err),
    }
    .map_err(|err| error_response(state, Some(user), err))?;
    if post.post().author() != user.id() {
        info!(
            "{} may not edit post {}; redirecting",
            user.username(),
            post.post().id()
        );
        counter_add!(state.instruments, "posts.edits.refused", 1);
        return Err(found(&post_path(post.post().id())));
    }
    Ok(post)
}

/// `GET /posts/{id}/edit/`: the post form, filled-in
async fn edit_form(
    State(state): State<Arc<Quill>>,
    Extension(user): Extension<User>,
    id: StdResult<Path<PostId>, PathRejection>,
    uri: Uri,
) -> Response {
    let post = match authored_post(&state, &user, id, &uri).await {
        Ok(post) => post,
        Err(rsp) => return rsp,
    };
    match state.storage.groups().await.context(GroupsSnafu) {
        Ok(groups) => render_post_form(
            &state,
            &user,
            &groups,
            PostFormState {
                post_id: Some(post.post().id()),
                text: post.post().text(),
                selected_group: post.post().group().map(|g| g.as_i64()),
                image: post.post().image(),
                errors: &FormErrors::default(),
            },
        ),
        Err(err) => error_response(&state, Some(&user), err),
    }
}

/// `POST /posts/{id}/edit/`: update a post (author only) & return to it
///
/// Authorship is settled before the body is read, so anyone else is redirected whatever they
/// sent.
async fn edit_post(
    State(state): State<Arc<Quill>>,
    Extension(user): Extension<User>,
    id: StdResult<Path<PostId>, PathRejection>,
    uri: Uri,
    request: Request,
) -> Response {
    async fn edit_post1(
        state: &Quill,
        post: &PostView,
        submission: PostSubmission,
    ) -> Result<Submitted> {
        let valid = match check_submission(state, submission, post.post().image()).await? {
            Ok(valid) => valid,
            Err(invalid) => return Ok(invalid),
        };
        let image = match (&valid.image, valid.clear_image) {
            (Some(upload), _) => ImageChange::Replace(
                state
                    .media
                    .save_post_image(upload)
                    .await
                    .context(MediaSnafu)?,
            ),
            (None, true) => ImageChange::Clear,
            (None, false) => ImageChange::Keep,
        };
        let id = post.post().id();
        state
            .storage
            .update_post(id, &valid.text, valid.group, &image)
            .await
            .context(PostsSnafu)?;
        counter_add!(state.instruments, "posts.edited", 1);
        Ok(Submitted::Saved(post_path(id)))
    }

    let post = match authored_post(&state, &user, id, &uri).await {
        Ok(post) => post,
        Err(rsp) => return rsp,
    };
    let submission = match PostSubmission::from_request(request, &state).await {
        Ok(submission) => submission,
        Err(rsp) => return rsp,
    };
    let result = edit_post1(&state, &post, submission).await;
    submitted_response(&state, &user, Some(post.post().id()), result)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Comments                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// `POST /posts/{id}/comment/`: comment on a post as the viewer
///
/// A blank comment isn't an error; the viewer is just sent back to the post.
async fn add_comment(
    State(state): State<Arc<Quill>>,
    Extension(user): Extension<User>,
    id: StdResult<Path<PostId>, PathRejection>,
    uri: Uri,
    form: StdResult<Form<CommentForm>, FormRejection>,
) -> Response {
    async fn add_comment1(
        state: &Quill,
        user: &User,
        id: StdResult<Path<PostId>, PathRejection>,
        uri: &Uri,
        form: CommentForm,
    ) -> Result<PostId> {
        let post = find_post(state, post_id(id, uri)?, uri).await?;
        let id = post.post().id();
        match CommentText::new(&form.text) {
            Ok(text) => {
                let comment = state
                    .storage
                    .add_comment(id, &user.id(), &text)
                    .await
                    .context(CommentsSnafu)?;
                debug!("{} added comment {} to {}", user.username(), comment.id(), id);
                counter_add!(state.instruments, "posts.comments.added", 1);
            }
            Err(_) => {
                counter_add!(state.instruments, "posts.comments.ignored", 1);
            }
        }
        Ok(id)
    }

    let form = form.map(|Form(form)| form).unwrap_or_default();
    match add_comment1(&state, &user, id, &uri, form).await {
        Ok(id) => found(&post_path(id)),
        Err(err) => error_response(&state, Some(&user), err),
    }
}

/// `GET /posts/{id}/comment/`: there's nothing to see; back to the post
async fn comment_redirect(
    State(state): State<Arc<Quill>>,
    Extension(user): Extension<User>,
    id: StdResult<Path<PostId>, PathRejection>,
    uri: Uri,
) -> Response {
    let result = match post_id(id, &uri) {
        Ok(id) => find_post(&state, id, &uri).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(post) => found(&post_path(post.post().id())),
        Err(err) => error_response(&state, Some(&user), err),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Following                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// `GET /profile/{username}/follow/`: follow an author (following twice changes nothing)
async fn profile_follow(
    State(state): State<Arc<Quill>>,
    Extension(user): Extension<User>,
    Path(username): Path<String>,
    uri: Uri,
) -> Response {
    async fn profile_follow1(
        state: &Quill,
        user: &User,
        username: &str,
        uri: &Uri,
    ) -> Result<Username> {
        let author = find_author(state, username, uri).await?;
        if author.id() == user.id() {
            debug!("{} tried to follow themselves", user.username());
        } else if state
            .storage
            .add_follow(&user.id(), &author.id())
            .await
            .context(FollowsSnafu)?
        {
            info!("{} now follows {}", user.username(), author.username());
            counter_add!(state.instruments, "posts.follows.added", 1);
        }
        Ok(author.username().clone())
    }

    match profile_follow1(&state, &user, &username, &uri).await {
        Ok(author) => found(&profile_path(&author)),
        Err(err) => error_response(&state, Some(&user), err),
    }
}

/// `GET /profile/{username}/unfollow/`: stop following an author
async fn profile_unfollow(
    State(state): State<Arc<Quill>>,
    Extension(user): Extension<User>,
    Path(username): Path<String>,
    uri: Uri,
) -> Response {
    async fn profile_unfollow1(
        state: &Quill,
        user: &User,
        username: &str,
        uri: &Uri,
    ) -> Result<Username> {
        let author = find_author(state, username, uri).await?;
        let removed = state
            .storage
            .remove_follow(&user.id(), &author.id())
            .await
            .context(FollowsSnafu)?;
        if removed > 0 {
            info!("{} no longer follows {}", user.username(), author.username());
            counter_add!(state.instruments, "posts.follows.removed", removed as u64);
        }
        Ok(author.username().clone())
    }

    match profile_unfollow1(&state, &user, &username, &uri).await {
        Ok(author) => found(&profile_path(&author)),
        Err(err) => error_response(&state, Some(&user), err),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the posts, groups, profiles & follows
///
/// Only the global feed is page-cached. Everything requiring a logged-in user sits behind
/// [require_login].
pub fn make_router(state: Arc<Quill>) -> Router<Arc<Quill>> {
    let public = Router::new()
        .route(
            "/",
            get(index).layer(axum::middleware::from_fn_with_state(
                state.clone(),
                cache_page,
            )),
        )
        .route("/group/{slug}/", get(group_posts))
        .route("/profile/{username}/", get(profile))
        .route("/posts/{id}/", get(post_detail));

    let private = Router::new()
        .route("/create/", get(create_form).post(create_post))
        .route("/posts/{id}/edit/", get(edit_form).post(edit_post))
        .route(
            "/posts/{id}/comment/",
            get(comment_redirect).post(add_comment),
        )
        .route("/follow/", get(follow_index))
        .route("/profile/{username}/follow/", get(profile_follow))
        .route("/profile/{username}/unfollow/", get(profile_unfollow))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_login,
        ));

    public.merge(private).with_state(state)
}
