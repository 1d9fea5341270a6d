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

//! # quill accounts
//!
//! Signing-up, logging-in & logging-out. A successful signup or login mints a session token &
//! hands it to the browser in the session cookie; logging-out just removes the cookie.

use std::sync::Arc;

use axum::{
    extract::{rejection::FormRejection, rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Form, Router,
};
use axum_extra::extract::cookie::CookieJar;
use secrecy::{ExposeSecret, SecretString};
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::{debug, error, info};

use crate::{
    authn::{self, check_password, removal_cookie, session_cookie, Viewer},
    counter_add,
    entities::{self, User, Username},
    forms::{local_next, FormErrors, LoginForm, NextQuery, SignupForm, REQUIRED},
    http::{found, internal_error_page, render},
    metrics::{self, Sort},
    peppers,
    quill::Quill,
    signing_keys,
    storage,
    token::{self, mint_token},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to create user {username}: {source}"))]
    AddUser {
        username: Username,
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to authenticate {username}: {source}"))]
    Authn {
        username: Username,
        source: authn::Error,
    },
    #[snafu(display("No pepper available: {source}"))]
    NoPepper {
        source: peppers::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("No signing keys available: {source}"))]
    NoKeys {
        source: signing_keys::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to mint a token for {username}: {source}"))]
    Token {
        username: Username,
        source: token::Error,
    },
    #[snafu(display("Failed to create user {username}: {source}"))]
    User {
        username: Username,
        source: entities::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

pub const INVALID_LOGIN: &str =
    "Please enter a correct username and password. Note that both fields may be case-sensitive.";
pub const INVALID_USERNAME: &str = "Enter a valid username. This value may contain only letters, \
                                    numbers, and @/./+/-/_ characters.";
pub const USERNAME_TAKEN: &str = "A user with that username already exists.";
pub const PASSWORD_MISMATCH: &str = "The two password fields didn't match.";

/// Mint a session token for `user` & wrap it in a cookie added to `jar`
fn start_session(state: &Quill, jar: CookieJar, user: &User) -> Result<CookieJar> {
    let (keyid, signing_key) = state.signing_keys.current().context(NoKeysSnafu)?;
    let token = mint_token(
        user.username(),
        &keyid,
        &signing_key,
        &state.issuer,
        &state.session_lifetime,
    )
    .context(TokenSnafu {
        username: user.username().clone(),
    })?;
    Ok(jar.add(session_cookie(
        token,
        &state.session_lifetime,
        state.secure_cookies,
    )))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         `/auth/signup/`                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("users.signups.successful", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("users.signups.failures", Sort::IntegralCounter) }

fn render_signup(
    state: &Quill,
    viewer: Option<&User>,
    username: &str,
    display_name: &str,
    errors: &FormErrors,
) -> Response {
    let mut context = tera::Context::new();
    context.insert("username", username);
    context.insert("display_name", display_name);
    context.insert("errors", errors);
    render(state, viewer, StatusCode::OK, "signup.html", context)
}

async fn signup_form(State(state): State<Arc<Quill>>, viewer: Viewer) -> Response {
    render_signup(&state, viewer.user(), "", "", &FormErrors::default())
}

/// Check the signup form; on success, return the new (not yet stored) [User]
fn validate_signup(state: &Quill, form: &SignupForm) -> Result<StdResult<User, FormErrors>> {
    let mut errors = FormErrors::default();

    let username = match form.username.trim() {
        "" => {
            errors.add("username", REQUIRED);
            None
        }
        name => Username::new(name)
            .map_err(|_| errors.add("username", INVALID_USERNAME))
            .ok(),
    };

    let password = match (&form.password1, &form.password2) {
        (Some(p1), Some(p2)) if !p1.expose_secret().is_empty() => {
            if p1.expose_secret() == p2.expose_secret() {
                Some(p1)
            } else {
                errors.add("password2", PASSWORD_MISMATCH);
                None
            }
        }
        (p1, p2) => {
            if p1.as_ref().map(|p| p.expose_secret().is_empty()).unwrap_or(true) {
                errors.add("password1", REQUIRED);
            }
            if p2.as_ref().map(|p| p.expose_secret().is_empty()).unwrap_or(true) {
                errors.add("password2", REQUIRED);
            }
            None
        }
    };

    let (Some(username), Some(password)) = (username, password) else {
        return Ok(Err(errors));
    };

    let (version, pepper) = state.peppers.current_pepper().context(NoPepperSnafu)?;
    match User::new(
        &version,
        &pepper,
        &username,
        password,
        Some(form.display_name.as_str()),
    ) {
        Ok(user) => Ok(Ok(user)),
        Err(entities::Error::PasswordEntropy { feedback, .. }) => {
            errors.add("password1", format!("This password is too weak. {}", feedback));
            Ok(Err(errors))
        }
        Err(entities::Error::PasswordWhitespace { .. }) => {
            errors.add(
                "password1",
                "Passwords may not begin or end with whitespace.",
            );
            Ok(Err(errors))
        }
        Err(err) => Err(err).context(UserSnafu { username }),
    }
}

/// `POST /auth/signup/`: create an account, log it in & go to the front page
async fn signup(
    State(state): State<Arc<Quill>>,
    viewer: Viewer,
    jar: CookieJar,
    form: StdResult<Form<SignupForm>, FormRejection>,
) -> Response {
    async fn signup1(
        state: &Quill,
        jar: CookieJar,
        form: &SignupForm,
    ) -> Result<StdResult<CookieJar, FormErrors>> {
        let user = match validate_signup(state, form)? {
            Ok(user) => user,
            Err(errors) => return Ok(Err(errors)),
        };
        match state.storage.add_user(&user).await {
            Ok(()) => (),
            Err(storage::Error::UsernameClaimed { .. }) => {
                let mut errors = FormErrors::default();
                errors.add("username", USERNAME_TAKEN);
                return Ok(Err(errors));
            }
            Err(err) => {
                return Err(err).context(AddUserSnafu {
                    username: user.username().clone(),
                })
            }
        }
        info!("New user {} signed-up", user.username());
        Ok(Ok(start_session(state, jar, &user)?))
    }

    let form = form.map(|Form(form)| form).unwrap_or_default();
    match signup1(&state, jar, &form).await {
        Ok(Ok(jar)) => {
            counter_add!(state.instruments, "users.signups.successful", 1);
            (jar, found("/")).into_response()
        }
        Ok(Err(errors)) => {
            debug!("Invalid signup: {:?}", errors);
            counter_add!(state.instruments, "users.signups.failures", 1);
            render_signup(
                &state,
                viewer.user(),
                &form.username,
                &form.display_name,
                &errors,
            )
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "users.signups.failures", 1);
            internal_error_page(&state, viewer.user())
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         `/auth/login/`                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("users.logins.successful", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("users.logins.failures", Sort::IntegralCounter) }

fn render_login(
    state: &Quill,
    viewer: Option<&User>,
    username: &str,
    next: Option<&str>,
    error: Option<&str>,
) -> Response {
    let mut context = tera::Context::new();
    context.insert("username", username);
    context.insert("next", local_next(next).unwrap_or(""));
    context.insert("error", &error);
    render(state, viewer, StatusCode::OK, "login.html", context)
}

async fn login_form(
    State(state): State<Arc<Quill>>,
    viewer: Viewer,
    query: StdResult<Query<NextQuery>, QueryRejection>,
) -> Response {
    let query = query.map(|Query(q)| q).unwrap_or_default();
    render_login(&state, viewer.user(), "", query.next.as_deref(), None)
}

/// `POST /auth/login/`: check credentials, start a session & go where the user was headed
async fn login(
    State(state): State<Arc<Quill>>,
    viewer: Viewer,
    jar: CookieJar,
    form: StdResult<Form<LoginForm>, FormRejection>,
) -> Response {
    async fn login1(
        state: &Quill,
        jar: CookieJar,
        username: &Username,
        password: &SecretString,
    ) -> Result<CookieJar> {
        let user = check_password(state.storage.as_ref(), &state.peppers, username, password)
            .await
            .context(AuthnSnafu {
                username: username.clone(),
            })?;
        start_session(state, jar, &user)
    }

    let form = form.map(|Form(form)| form).unwrap_or_default();
    let next = local_next(form.next.as_deref()).unwrap_or("/").to_owned();
    let (Ok(username), Some(password)) = (Username::new(form.username.trim()), &form.password)
    else {
        counter_add!(state.instruments, "users.logins.failures", 1);
        return render_login(
            &state,
            viewer.user(),
            &form.username,
            form.next.as_deref(),
            Some(INVALID_LOGIN),
        );
    };

    match login1(&state, jar, &username, password).await {
        Ok(jar) => {
            info!("Logged-in user {}", username);
            counter_add!(state.instruments, "users.logins.successful", 1);
            (jar, found(&next)).into_response()
        }
        Err(Error::Authn {
            source: authn::Error::User { .. },
            ..
        }) => {
            error!("Failed to look up {} at login", username);
            counter_add!(state.instruments, "users.logins.failures", 1);
            internal_error_page(&state, viewer.user())
        }
        Err(Error::Authn { source, .. }) => {
            info!("Failed login for {}: {}", username, source);
            counter_add!(state.instruments, "users.logins.failures", 1);
            render_login(
                &state,
                viewer.user(),
                &form.username,
                form.next.as_deref(),
                Some(INVALID_LOGIN),
            )
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "users.logins.failures", 1);
            internal_error_page(&state, viewer.user())
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         `/auth/logout/`                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("users.logouts", Sort::IntegralCounter) }

async fn logout(State(state): State<Arc<Quill>>, viewer: Viewer, jar: CookieJar) -> Response {
    if let Some(user) = viewer.user() {
        info!("Logged-out user {}", user.username());
    }
    counter_add!(state.instruments, "users.logouts", 1);
    (jar.remove(removal_cookie()), found("/")).into_response()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the account pages
pub fn make_router(state: Arc<Quill>) -> Router<Arc<Quill>> {
    Router::new()
        .route("/auth/signup/", get(signup_form).post(signup))
        .route("/auth/login/", get(login_form).post(login))
        .route("/auth/logout/", get(logout).post(logout))
        .with_state(state)
}
