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

//! # quill forms
//!
//! Submitted form data, and the rules mapping it onto entity mutations. Validation failures are
//! collected per field as [FormErrors] so that the form can be re-rendered with messages next to
//! the offending inputs.
//!
//! The post form may arrive either `multipart/form-data` (the only way to attach an image) or
//! `application/x-www-form-urlencoded`; [PostSubmission] accepts both.

use std::collections::BTreeMap;

use axum::{
    extract::{FromRequest, Multipart, Request},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    Form,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    entities::{GroupId, PostText},
    media::Upload,
};

type StdResult<T, E> = std::result::Result<T, E>;

pub const REQUIRED: &str = "This field is required.";
pub const INVALID_CHOICE: &str =
    "Select a valid choice. That choice is not one of the available choices.";
pub const INVALID_IMAGE: &str =
    "Upload a valid image. The file you uploaded was either not an image or a corrupted image.";

/// Field-level validation messages, keyed by field name
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FormErrors(BTreeMap<&'static str, Vec<String>>);

impl FormErrors {
    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.entry(field).or_default().push(message.into());
    }
    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Post form                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default, Deserialize)]
struct UrlEncodedPost {
    #[serde(default)]
    text: String,
    #[serde(default)]
    group: String,
    #[serde(default, rename = "image-clear")]
    image_clear: Option<String>,
}

/// A post form, as submitted & before validation
#[derive(Clone, Debug, Default)]
pub struct PostSubmission {
    pub text: String,
    pub group: String,
    pub image: Option<Upload>,
    pub image_clear: bool,
}

/// A post form that passed validation
#[derive(Clone, Debug)]
pub struct ValidPost {
    pub text: PostText,
    pub group: Option<GroupId>,
    pub image: Option<Upload>,
    pub clear_image: bool,
}

fn bad_request(err: impl std::fmt::Display) -> Response {
    (StatusCode::BAD_REQUEST, format!("{}", err)).into_response()
}

impl PostSubmission {
    async fn from_multipart(mut multipart: Multipart) -> StdResult<PostSubmission, Response> {
        let mut submission = PostSubmission::default();
        while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
            match field.name() {
                Some("text") => submission.text = field.text().await.map_err(bad_request)?,
                Some("group") => submission.group = field.text().await.map_err(bad_request)?,
                Some("image-clear") => submission.image_clear = true,
                Some("image") => {
                    let file_name = field.file_name().unwrap_or_default().to_owned();
                    let bytes = field.bytes().await.map_err(bad_request)?;
                    // Browsers send an empty, nameless part when no file was chosen
                    if !file_name.is_empty() || !bytes.is_empty() {
                        submission.image = Some(Upload { file_name, bytes });
                    }
                }
                other => debug!("Ignoring unexpected form field {:?}", other),
            }
        }
        Ok(submission)
    }
    /// Check this submission against the rules for posts; `groups` are the ids of every extant
    /// group
    pub fn validate(self, groups: &[GroupId]) -> StdResult<ValidPost, FormErrors> {
        let mut errors = FormErrors::default();

        let text = PostText::new(&self.text)
            .map_err(|_| errors.add("text", REQUIRED))
            .ok();

        let group = match self.group.trim() {
            "" => None,
            s => match s.parse::<i64>().map(GroupId::new) {
                Ok(id) if groups.contains(&id) => Some(id),
                _ => {
                    errors.add("group", INVALID_CHOICE);
                    None
                }
            },
        };

        if let Some(upload) = &self.image {
            if !upload.is_image() {
                errors.add("image", INVALID_IMAGE);
            }
        }

        match text {
            Some(text) if errors.is_empty() => Ok(ValidPost {
                text,
                group,
                image: self.image,
                clear_image: self.image_clear,
            }),
            _ => Err(errors),
        }
    }
}

impl<S: Send + Sync> FromRequest<S> for PostSubmission {
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> StdResult<Self, Self::Rejection> {
        let is_multipart = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.starts_with("multipart/form-data"))
            .unwrap_or(false);
        if is_multipart {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(IntoResponse::into_response)?;
            PostSubmission::from_multipart(multipart).await
        } else {
            let Form(form) = Form::<UrlEncodedPost>::from_request(req, state)
                .await
                .map_err(IntoResponse::into_response)?;
            Ok(PostSubmission {
                text: form.text,
                group: form.group,
                image: None,
                image_clear: form.image_clear.is_some(),
            })
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         Other forms                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The comment form; a missing field is treated like an empty one
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CommentForm {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    pub password: Option<SecretString>,
    pub next: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SignupForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    pub password1: Option<SecretString>,
    pub password2: Option<SecretString>,
}

/// The query string of the login page
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NextQuery {
    pub next: Option<String>,
}

/// Accept `next` only if it's a path on this site
///
/// Anything else ("https://evil.example", "//evil.example") would make the login form an open
/// redirect.
pub fn local_next(next: Option<&str>) -> Option<&str> {
    next.filter(|s| s.starts_with('/') && !s.starts_with("//") && !s.contains('\\'))
}

#[cfg(test)]
mod test {
    use super::*;

    use axum::body::Bytes;

    fn submission(text: &str, group: &str) -> PostSubmission {
        PostSubmission {
            text: text.to_owned(),
            group: group.to_owned(),
            image: None,
            image_clear: false,
        }
    }

    #[test]
    fn post_rules() {
        let groups = [GroupId::new(1), GroupId::new(2)];

        let valid = submission("Hello, world", "2").validate(&groups).unwrap();
        assert_eq!(valid.text.as_ref(), "Hello, world");
        assert_eq!(valid.group, Some(GroupId::new(2)));

        let valid = submission("Hello, world", "").validate(&groups).unwrap();
        assert_eq!(valid.group, None);

        let errors = submission("  \n", "").validate(&groups).unwrap_err();
        assert_eq!(errors.get("text"), Some(&[REQUIRED.to_owned()][..]));
        assert_eq!(errors.get("group"), None);

        let errors = submission("text", "7").validate(&groups).unwrap_err();
        assert_eq!(errors.get("group"), Some(&[INVALID_CHOICE.to_owned()][..]));
        let errors = submission("text", "cats").validate(&groups).unwrap_err();
        assert_eq!(errors.get("group"), Some(&[INVALID_CHOICE.to_owned()][..]));

        let mut bad_image = submission("text", "");
        bad_image.image = Some(Upload {
            file_name: "cat.png".to_owned(),
            bytes: Bytes::from_static(b"not really a cat"),
        });
        let errors = bad_image.validate(&groups).unwrap_err();
        assert_eq!(errors.get("image"), Some(&[INVALID_IMAGE.to_owned()][..]));
    }

    #[test]
    fn next_must_be_local() {
        assert_eq!(local_next(Some("/create/")), Some("/create/"));
        assert_eq!(local_next(Some("https://example.com/")), None);
        assert_eq!(local_next(Some("//example.com/")), None);
        assert_eq!(local_next(None), None);
    }
}
