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

//! # quill authentication
//!
//! quill is a browser-facing site, so a session is carried in a cookie: an HMAC-signed JWT (see
//! [crate::token]) naming the user. The [authenticate] middleware runs on every request, resolving
//! that cookie to a [User] & stashing it in the request extensions; a missing, expired or otherwise
//! bad cookie just leaves the request anonymous. Routes that need a user are wrapped in
//! [require_login], which sends guests to the login page.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use secrecy::SecretString;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tracing::{debug, info};

use crate::{
    counter_add,
    entities::{self, User, Username},
    http::found,
    metrics::{self, Sort},
    peppers::Peppers,
    quill::Quill,
    storage::{self, Backend as StorageBackend},
    token::{self, verify_token},
};

/// Name of the session cookie
pub const SESSION_COOKIE: &str = "quill-session";

/// The login page
pub const LOGIN_PATH: &str = "/auth/login/";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to validate password for {username}: {source}"))]
    BadPassword {
        username: Username,
        #[snafu(source(from(entities::Error, Box::new)))]
        source: Box<entities::Error>,
    },
    #[snafu(display("Failed to look up user {username}: {source}"))]
    User {
        username: Username,
        source: storage::Error,
    },
    #[snafu(display("Invalid session token: {source}"))]
    Token {
        source: token::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("No such user {username}"))]
    UnknownUser {
        username: Username,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                Authentication Utility Functions                                //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Authenticate a user by [Username] & password. On success, return the full [User].
pub async fn check_password(
    storage: &(dyn StorageBackend + Send + Sync),
    peppers: &Peppers,
    username: &Username,
    password: &SecretString,
) -> Result<User> {
    let user = storage
        .user_for_name(username)
        .await
        .context(UserSnafu {
            username: username.clone(),
        })?
        .context(UnknownUserSnafu {
            username: username.clone(),
        })?;
    user.check_password(peppers, password)
        .context(BadPasswordSnafu {
            username: username.clone(),
        })?;
    Ok(user)
}

/// Authenticate a session token. On success, return the full [User] it names.
pub async fn check_token(state: &Quill, token_string: &str) -> Result<User> {
    let username = verify_token(token_string, &state.signing_keys, &state.issuer)
        .context(TokenSnafu)?;
    state
        .storage
        .user_for_name(&username)
        .await
        .context(UserSnafu {
            username: username.clone(),
        })?
        .context(UnknownUserSnafu {
            username: username.clone(),
        })
}

/// Build the session cookie carrying `token`
pub fn session_cookie(token: String, lifetime: &chrono::Duration, secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(time::Duration::seconds(lifetime.num_seconds()))
        .build()
}

/// The session cookie, as named for removal from a [CookieJar]
pub fn removal_cookie() -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, "")).path("/").build()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Middleware                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("session.auth.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("session.auth.failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("session.login.redirects", Sort::IntegralCounter) }

/// Resolve the session cookie, if any, to a [User]
///
/// On success the [User] is inserted into the request's extensions. On failure the request goes
/// through anyway, anonymously; routes that need a user are guarded by [require_login].
pub async fn authenticate(
    State(state): State<Arc<Quill>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(cookie) = jar.get(SESSION_COOKIE) else {
        return next.run(request).await;
    };
    if cookie.value().is_empty() {
        return next.run(request).await;
    }

    match check_token(&state, cookie.value()).await {
        Ok(user) => {
            debug!("quill authenticated user {}", user.username());
            counter_add!(state.instruments, "session.auth.successes", 1);
            request.extensions_mut().insert(user);
        }
        Err(err) => {
            info!("Ignoring an invalid session cookie: {}", err);
            counter_add!(state.instruments, "session.auth.failures", 1);
        }
    }
    next.run(request).await
}

/// The login URL that will bring the user back to `path_and_query` afterward
pub fn login_url(path_and_query: &str) -> String {
    format!(
        "{}?{}",
        LOGIN_PATH,
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("next", path_and_query)
            .finish()
    )
}

/// Redirect anonymous requests to the login page
pub async fn require_login(
    State(state): State<Arc<Quill>>,
    request: Request,
    next: Next,
) -> Response {
    if request.extensions().get::<User>().is_some() {
        next.run(request).await
    } else {
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        debug!("Sending a guest requesting {} to the login page", path);
        counter_add!(state.instruments, "session.login.redirects", 1);
        found(&login_url(path))
    }
}

/// The user making a request, if they're logged-in
#[derive(Clone, Debug, Default)]
pub struct Viewer(pub Option<User>);

impl Viewer {
    pub fn user(&self) -> Option<&User> {
        self.0.as_ref()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Viewer {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        Ok(Viewer(parts.extensions.get::<User>().cloned()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn login_redirects() {
        assert_eq!(login_url("/create/"), "/auth/login/?next=%2Fcreate%2F");
        assert_eq!(
            login_url("/follow/?page=2"),
            "/auth/login/?next=%2Ffollow%2F%3Fpage%3D2"
        );
    }

    #[test]
    fn cookies() {
        let cookie = session_cookie("abc".to_owned(), &chrono::Duration::days(14), false);
        assert_eq!(cookie.name(), SESSION_COOKIE);
        assert_eq!(cookie.value(), "abc");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.max_age(), Some(time::Duration::days(14)));
    }
}
