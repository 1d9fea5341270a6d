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

//! # quill entities
//!
//! ## Introduction
//!
//! The foundational types: users, groups, posts, comments & follows, along with the refined value
//! types out of which they're built. Rows are decoded straight into these types (via
//! [sqlx::FromRow]), so a value of any of them read from the database has been validated.

use std::{fmt::Display, ops::Deref, str::FromStr};

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHashString, SaltString},
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{prelude::*, Backtrace, IntoError};
use tracing::debug;
use uuid::Uuid;
use zxcvbn::{feedback::Feedback, zxcvbn, Score};

use crate::peppers::{self, Pepper, Peppers, Version as PepperVersion};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Incorrect password"))]
    BadPassword { backtrace: Backtrace },
    #[snafu(display("{text} is not a valid group slug"))]
    BadSlug { text: String, backtrace: Backtrace },
    #[snafu(display("{name} is not a valid quill username"))]
    BadUsername { name: String },
    #[snafu(display("Failed to check the password for {username}: {source}"))]
    CheckPassword {
        username: Username,
        source: argon2::password_hash::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Text may not be empty"))]
    EmptyText { backtrace: Backtrace },
    #[snafu(display("Failed to hash password: {source}"))]
    HashPassword {
        source: argon2::password_hash::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Bad hash string: {source}"))]
    HashString {
        source: argon2::password_hash::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to build an Argon2id password hasher: {source}"))]
    Hasher {
        source: argon2::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("No pepper found for user {username}: {source}"))]
    NoPepper {
        username: Username,
        source: peppers::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Password doesn't have enough entropy: {feedback}"))]
    PasswordEntropy {
        feedback: Feedback,
        backtrace: Backtrace,
    },
    #[snafu(display("Passwords may not begin or end in whitespace"))]
    PasswordWhitespace { backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

fn mk_serde_de_err<'de, D: serde::Deserializer<'de>>(err: impl std::error::Error) -> D::Error {
    <D::Error as serde::de::Error>::custom(format!("{:?}", err))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Declare an opaque, UUID-based identifier
///
/// Users are identified by UUIDs, assigned by the application at signup.
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, sqlx::Type)]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $type_name(Uuid);
        impl $type_name {
            pub fn new() -> $type_name {
                $type_name(Uuid::new_v4())
            }
        }
        impl Default for $type_name {
            fn default() -> Self {
                Self::new()
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// Declare an identifier assigned by the database
///
/// Posts, groups & comments are numbered by the datastore on insert; their identifiers
/// show up in URLs (`/posts/17/`), which is why they're small integers rather than UUIDs.
macro_rules! define_serial {
    ($type_name:ident) => {
        #[derive(
            Clone,
            Copy,
            Debug,
            Deserialize,
            Eq,
            Hash,
            Ord,
            PartialEq,
            PartialOrd,
            Serialize,
            sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $type_name(i64);
        impl $type_name {
            pub fn new(id: i64) -> $type_name {
                $type_name(id)
            }
            pub fn as_i64(&self) -> i64 {
                self.0
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl FromStr for $type_name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> StdResult<Self, Self::Err> {
                Ok($type_name(s.parse::<i64>()?))
            }
        }
    };
}

define_id!(UserId);
define_serial!(PostId);
define_serial!(GroupId);
define_serial!(CommentId);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Username                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

// quill usernames must be ASCII, may be from one to one hundred fifty characters in length, and
// must be made up of letters, digits & "@.+-_".
const MAX_USERNAME_LENGTH: usize = 150;

lazy_static! {
    static ref USERNAME: Regex = Regex::new("^[-a-zA-Z0-9_.@+]+$").unwrap(/* known good */);
}

fn check_username(s: &str) -> bool {
    s.is_ascii() && s.len() <= MAX_USERNAME_LENGTH && USERNAME.is_match(s)
}

/// A refined type representing a quill username
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
    /// Construct a [Username] from a `&str`
    ///
    /// To *move* a [String] into a [Username] (with validity checking) use [TryFrom::try_from()]
    pub fn new(name: &str) -> Result<Username> {
        check_username(name)
            .then_some(Username(name.to_owned()))
            .ok_or(
                BadUsernameSnafu {
                    name: name.to_owned(),
                }
                .build(),
            )
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for Username {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Implement `Deserialize` by hand to fail if the serialized value isn't a legit `Username`
impl<'de> Deserialize<'de> for Username {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Username::try_from(s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for Username {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Username {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Username::new(s)
    }
}

impl TryFrom<String> for Username {
    type Error = Error;

    fn try_from(name: String) -> std::result::Result<Self, Self::Error> {
        if check_username(&name) {
            Ok(Username(name))
        } else {
            BadUsernameSnafu { name }.fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           GroupSlug                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

const MAX_SLUG_LENGTH: usize = 50;

lazy_static! {
    static ref SLUG: Regex = Regex::new("^[-a-zA-Z0-9_]+$").unwrap(/* known good */);
}

/// The URL-safe, unique handle for a [Group]
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct GroupSlug(String);

impl GroupSlug {
    pub fn new(text: &str) -> Result<GroupSlug> {
        GroupSlug::try_from(text.to_owned())
    }
}

impl AsRef<str> for GroupSlug {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for GroupSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GroupSlug {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        GroupSlug::new(s)
    }
}

impl TryFrom<String> for GroupSlug {
    type Error = Error;

    fn try_from(text: String) -> std::result::Result<Self, Self::Error> {
        if text.len() <= MAX_SLUG_LENGTH && SLUG.is_match(&text) {
            Ok(GroupSlug(text))
        } else {
            BadSlugSnafu { text }.fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       PostText & friends                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn check_text(text: &str) -> bool {
    !text.trim().is_empty()
}

/// The body of a post; may not be empty or consist only of whitespace
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PostText(String);

impl PostText {
    pub fn new(text: &str) -> Result<PostText> {
        PostText::try_from(text.to_owned())
    }
}

impl AsRef<str> for PostText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PostText {
    type Error = Error;

    fn try_from(text: String) -> std::result::Result<Self, Self::Error> {
        check_text(&text)
            .then_some(PostText(text))
            .context(EmptyTextSnafu)
    }
}

/// The body of a comment; same rules as [PostText]
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CommentText(String);

impl CommentText {
    pub fn new(text: &str) -> Result<CommentText> {
        CommentText::try_from(text.to_owned())
    }
}

impl AsRef<str> for CommentText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CommentText {
    type Error = Error;

    fn try_from(text: String) -> std::result::Result<Self, Self::Error> {
        check_text(&text)
            .then_some(CommentText(text))
            .context(EmptyTextSnafu)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         UserHashString                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Newtype wrapping a [PasswordHashString] (the PHC string format)
#[derive(Clone, Debug, PartialEq)]
pub struct UserHashString(PasswordHashString);

impl UserHashString {
    pub fn password_hash(&self) -> PasswordHash<'_> {
        self.0.password_hash()
    }
}

impl AsRef<str> for UserHashString {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl TryFrom<String> for UserHashString {
    type Error = Error;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Ok(UserHashString(
            PasswordHashString::new(&s).context(HashStringSnafu)?,
        ))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              User                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Represents a quill user
#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
pub struct User {
    id: UserId,
    #[sqlx(try_from = "String")]
    username: Username,
    display_name: String,
    #[serde(skip)]
    #[sqlx(try_from = "String")]
    password_hash: UserHashString,
    #[serde(skip)]
    #[sqlx(try_from = "String")]
    pepper_version: PepperVersion,
    joined: DateTime<Utc>,
}

/// Apply password validation rules
///
/// Passwords that begin or end with whitespace are rejected since that's likely to be a mistake
/// that will drive the user bonkers when they try to login. Beyond that, [zxcvbn] does the work:
/// reject passwords scoring less than three on its zero-to-four scale.
fn validate_password(password: &SecretString, user_inputs: &[&str]) -> Result<()> {
    if password
        .expose_secret()
        .starts_with(|c: char| c.is_whitespace())
        || password
            .expose_secret()
            .ends_with(|c: char| c.is_whitespace())
    {
        return PasswordWhitespaceSnafu.fail();
    }

    let entropy = zxcvbn(password.expose_secret(), user_inputs);
    if entropy.score() < Score::Three {
        return PasswordEntropySnafu {
            // Feedback is set "when score <= 2", so the `unwrap()` below is safe.
            feedback: entropy.feedback().unwrap().clone(),
        }
        .fail();
    }

    debug!(
        "Password check: this password would take O({}) guesses",
        entropy.guesses_log10()
    );
    Ok(())
}

impl User {
    /// Create a new [User]
    ///
    /// This will validate the password, but not the uniqueness of the username; that's up to the
    /// storage layer.
    pub fn new(
        pepper_version: &PepperVersion,
        pepper_key: &Pepper,
        username: &Username,
        password: &SecretString,
        display_name: Option<&str>,
    ) -> Result<User> {
        validate_password(password, &[username.as_ref()])?;
        let password_hash = User::hash_password(pepper_key, password)?;
        Ok(User {
            id: UserId::new(),
            username: username.clone(),
            display_name: display_name
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(username.as_ref())
                .to_owned(),
            password_hash: UserHashString(password_hash),
            pepper_version: pepper_version.clone(),
            joined: Utc::now(),
        })
    }
    /// Validate a password
    pub fn check_password(&self, peppers: &Peppers, password: &SecretString) -> Result<()> {
        let pepper = peppers
            .find_by_version(&self.pepper_version)
            .context(NoPepperSnafu {
                username: self.username.clone(),
            })?;
        let hasher = User::create_password_hasher(&pepper)?;
        match hasher.verify_password(
            password.expose_secret().as_bytes(),
            &self.password_hash.password_hash(),
        ) {
            Ok(_) => Ok(()),
            Err(argon2::password_hash::Error::Password) => BadPasswordSnafu.fail(),
            Err(err) => Err(CheckPasswordSnafu {
                username: self.username.clone(),
            }
            .into_error(err)),
        }
    }
    pub fn display_name(&self) -> &str {
        &self.display_name
    }
    pub fn hash(&self) -> &UserHashString {
        &self.password_hash
    }
    pub fn id(&self) -> UserId {
        self.id
    }
    pub fn joined(&self) -> DateTime<Utc> {
        self.joined
    }
    pub fn pepper_version(&self) -> &PepperVersion {
        &self.pepper_version
    }
    pub fn username(&self) -> &Username {
        &self.username
    }
    /// Create a quill password hasher
    ///
    /// Argon2id (with pepper) with the crate's default parameters (m=19456 (19 MiB), t=2, p=1),
    /// which are one of the configurations recommended by the OWASP Password Storage [Cheat Sheet].
    ///
    /// [Cheat Sheet]: https://cheatsheetseries.owasp.org/cheatsheets/Password_Storage_Cheat_Sheet.html#password-hashing-algorithms
    fn create_password_hasher(pepper: &Pepper) -> Result<Argon2<'_>> {
        Argon2::new_with_secret(
            pepper.as_ref().expose_secret(),
            Algorithm::Argon2id,
            Version::default(),
            Params::default(),
        )
        .context(HasherSnafu)
    }
    /// Salt & hash a password; the pepper is supplied via the Argon2 `secret` parameter.
    fn hash_password(pepper: &Pepper, password: &SecretString) -> Result<PasswordHashString> {
        let salt = SaltString::generate(&mut OsRng);
        let hasher = User::create_password_hasher(pepper)?;
        Ok(hasher
            .hash_password(password.expose_secret().as_bytes(), &salt)
            .context(HashPasswordSnafu)?
            .serialize())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Group                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A named topical category of posts
///
/// Groups are seeded administratively (see `quill-admin add-group`).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, sqlx::FromRow)]
pub struct Group {
    id: GroupId,
    title: String,
    #[sqlx(try_from = "String")]
    slug: GroupSlug,
    description: String,
}

impl Group {
    pub fn description(&self) -> &str {
        &self.description
    }
    pub fn id(&self) -> GroupId {
        self.id
    }
    pub fn slug(&self) -> &GroupSlug {
        &self.slug
    }
    pub fn title(&self) -> &str {
        &self.title
    }
}

impl Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.title)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Post                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Number of characters of text with which a [Post] represents itself
const POST_DISPLAY_CHARS: usize = 15;

/// Represents a quill post
///
/// `pub_date` is set by the datastore on insert & never changes thereafter.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, sqlx::FromRow)]
pub struct Post {
    id: PostId,
    text: String,
    pub_date: DateTime<Utc>,
    #[sqlx(rename = "author_id")]
    author: UserId,
    #[sqlx(rename = "group_id")]
    group: Option<GroupId>,
    image: Option<String>,
}

impl Post {
    pub fn author(&self) -> UserId {
        self.author
    }
    pub fn group(&self) -> Option<GroupId> {
        self.group
    }
    pub fn id(&self) -> PostId {
        self.id
    }
    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }
    pub fn pub_date(&self) -> DateTime<Utc> {
        self.pub_date
    }
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl Display for Post {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            self.text.chars().take(POST_DISPLAY_CHARS).collect::<String>()
        )
    }
}

/// A [Post] joined with what's needed to display it: its author's name & its group, if any
#[derive(Clone, Debug, Eq, PartialEq, Serialize, sqlx::FromRow)]
pub struct PostView {
    #[serde(flatten)]
    #[sqlx(flatten)]
    post: Post,
    #[sqlx(try_from = "String")]
    author_username: Username,
    author_display_name: String,
    group_title: Option<String>,
    group_slug: Option<String>,
}

impl PostView {
    pub fn author_display_name(&self) -> &str {
        &self.author_display_name
    }
    pub fn author_username(&self) -> &Username {
        &self.author_username
    }
    pub fn group_slug(&self) -> Option<&str> {
        self.group_slug.as_deref()
    }
    pub fn group_title(&self) -> Option<&str> {
        self.group_title.as_deref()
    }
    pub fn post(&self) -> &Post {
        &self.post
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Comment                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Eq, PartialEq, Serialize, sqlx::FromRow)]
pub struct Comment {
    id: CommentId,
    #[sqlx(rename = "post_id")]
    post: PostId,
    #[sqlx(rename = "author_id")]
    author: UserId,
    text: String,
    created: DateTime<Utc>,
}

impl Comment {
    pub fn author(&self) -> UserId {
        self.author
    }
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }
    pub fn id(&self) -> CommentId {
        self.id
    }
    pub fn post(&self) -> PostId {
        self.post
    }
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// A [Comment] along with its author's name
#[derive(Clone, Debug, Eq, PartialEq, Serialize, sqlx::FromRow)]
pub struct CommentView {
    #[serde(flatten)]
    #[sqlx(flatten)]
    comment: Comment,
    #[sqlx(try_from = "String")]
    author_username: Username,
}

impl CommentView {
    pub fn author_username(&self) -> &Username {
        &self.author_username
    }
    pub fn comment(&self) -> &Comment {
        &self.comment
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn usernames() {
        assert!(Username::new("leo").is_ok());
        assert!(Username::new("john.doe+blog@example").is_ok());
        assert!(Username::new("").is_err());
        assert!(Username::new("has space").is_err());
        assert!(Username::new("naïve").is_err());
        assert!(Username::new(&"a".repeat(151)).is_err());
        assert!(serde_json::from_str::<Username>("\"no/slash\"").is_err());
    }

    #[test]
    fn slugs() {
        assert!(GroupSlug::new("cats").is_ok());
        assert!(GroupSlug::new("test-slug_2").is_ok());
        assert!(GroupSlug::new("").is_err());
        assert!(GroupSlug::new("a/b").is_err());
        assert!(GroupSlug::new(&"s".repeat(51)).is_err());
    }

    #[test]
    fn text() {
        assert!(PostText::new("Hello").is_ok());
        assert!(PostText::new("   \n\t").is_err());
        assert!(CommentText::new("").is_err());
    }

    #[test]
    fn display_forms() {
        let post = Post {
            id: PostId::new(1),
            text: "Привет, это очень длинный пост".to_owned(),
            pub_date: Utc::now(),
            author: UserId::new(),
            group: None,
            image: None,
        };
        assert_eq!(format!("{}", post), "Привет, это оче");

        let group = Group {
            id: GroupId::new(1),
            title: "Cats".to_owned(),
            slug: GroupSlug::new("cats").unwrap(),
            description: "All about cats".to_owned(),
        };
        assert_eq!(format!("{}", group), "Cats");
    }

    #[test]
    fn passwords() {
        let version = PepperVersion::new("pepper-ver:20250101").unwrap();
        let pepper = Pepper::random();
        let peppers = Peppers::from([(version.clone(), pepper.clone())]);
        let username = Username::new("johndoe").unwrap();

        assert!(matches!(
            User::new(
                &version,
                &pepper,
                &username,
                &SecretString::from("password"),
                None
            ),
            Err(Error::PasswordEntropy { .. })
        ));
        assert!(matches!(
            User::new(
                &version,
                &pepper,
                &username,
                &SecretString::from(" vZ7#qL2!mB9xPw"),
                None
            ),
            Err(Error::PasswordWhitespace { .. })
        ));

        let user = User::new(
            &version,
            &pepper,
            &username,
            &SecretString::from("vZ7#qL2!mB9xPw"),
            Some("John Doe"),
        )
        .unwrap();
        assert_eq!(user.display_name(), "John Doe");
        assert!(user
            .check_password(&peppers, &SecretString::from("vZ7#qL2!mB9xPw"))
            .is_ok());
        assert!(matches!(
            user.check_password(&peppers, &SecretString::from("Tr0ub4dor&3")),
            Err(Error::BadPassword { .. })
        ));
    }
}
