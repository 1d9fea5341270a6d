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

//! # quill session tokens
//!
//! A logged-in browser carries a [JWT] in its session cookie. The token names the user, the host
//! that issued it & when it expires. It's signed (HMAC-SHA256) with the current [SigningKey] and
//! names that key in its header so that it can be verified after the key is rotated out of the
//! "current" position.
//!
//! [JWT]: https://www.rfc-editor.org/rfc/rfc7519.html

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use jwt::{Header, SignWithKey, Token, VerifyWithKey};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use snafu::{prelude::*, Backtrace};

use crate::{
    entities::Username,
    signing_keys::{self, KeyId, SigningKey, SigningKeys},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Token expired at {expires}"))]
    Expired {
        expires: DateTime<Utc>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create an HMAC: {source}"))]
    Hmac {
        source: hmac::digest::InvalidLength,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to refine a string to a KeyId: {source}"))]
    KeyId {
        source: signing_keys::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The Key ID was missing from the JWT"))]
    MissingKeyId { backtrace: Backtrace },
    #[snafu(display("No signing key matching {keyid}: {source}"))]
    NoKey {
        keyid: KeyId,
        source: signing_keys::Error,
    },
    #[snafu(display("Invalid token: not before {not_before}"))]
    NotBefore {
        not_before: DateTime<Utc>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse JWT: {source}"))]
    Parse {
        source: jwt::error::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to sign JWT claims: {source}"))]
    Signature {
        source: jwt::error::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Unknown token issuer {issuer}"))]
    UnknownIssuer { issuer: String, backtrace: Backtrace },
    #[snafu(display("Verification failure: {source}"))]
    Verification {
        source: jwt::error::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Session token [claims]
///
/// [claims]: https://pragmaticwebsecurity.com/articles/apisecurity/hard-parts-of-jwt.html
#[derive(Clone, Debug, Deserialize, Serialize)]
struct SessionClaims {
    #[serde(rename = "iat")]
    issued_at: DateTime<Utc>,
    #[serde(rename = "iss")]
    issuer: String,
    #[serde(rename = "nbf")]
    not_before: DateTime<Utc>,
    #[serde(rename = "exp")]
    expires: DateTime<Utc>,
    #[serde(rename = "sub")]
    subject: Username,
}

/// Mint a new session token
///
/// Mint a new token naming `username`, signed using `signing_key` (identified by `keyid`). The
/// token will be valid for `lifetime`. Returns the fully serialized JWT.
pub fn mint_token(
    username: &Username,
    keyid: &KeyId,
    signing_key: &SigningKey,
    issuer: &str,
    lifetime: &Duration,
) -> Result<String> {
    let key: Hmac<Sha256> =
        Hmac::new_from_slice(signing_key.as_ref().expose_secret()).context(HmacSnafu)?;
    let header = Header {
        key_id: Some(keyid.to_string()),
        ..Default::default()
    };
    let now = Utc::now();
    let claims = SessionClaims {
        issued_at: now,
        issuer: issuer.to_owned(),
        not_before: now,
        expires: now + *lifetime,
        subject: username.clone(),
    };
    Ok(Token::new(header, claims)
        .sign_with_key(&key)
        .context(SignatureSnafu)?
        .as_str()
        .to_owned())
}

/// Verify a session token, returning the [Username] it names
pub fn verify_token(token_string: &str, keys: &SigningKeys, issuer: &str) -> Result<Username> {
    let token: Token<Header, SessionClaims, _> =
        Token::parse_unverified(token_string).context(ParseSnafu)?;
    let keyid = token
        .header()
        .key_id
        .clone()
        .context(MissingKeyIdSnafu)?;
    let keyid = KeyId::new(&keyid).context(KeyIdSnafu)?;
    let signing_key = keys.find_by_version(&keyid).context(NoKeySnafu { keyid })?;
    let key: Hmac<Sha256> =
        Hmac::new_from_slice(signing_key.as_ref().expose_secret()).context(HmacSnafu)?;
    let token: Token<Header, SessionClaims, _> = token_string
        .verify_with_key(&key)
        .context(VerificationSnafu)?;
    let claims = token.claims();

    let now = Utc::now();
    if now < claims.not_before {
        return NotBeforeSnafu {
            not_before: claims.not_before,
        }
        .fail();
    }
    if now > claims.expires {
        return ExpiredSnafu {
            expires: claims.expires,
        }
        .fail();
    }
    if issuer != claims.issuer {
        return UnknownIssuerSnafu {
            issuer: claims.issuer.clone(),
        }
        .fail();
    }

    Ok(claims.subject.clone())
}

#[cfg(test)]
mod test {
    use super::*;

    fn keys() -> (KeyId, SigningKey) {
        (
            KeyId::new("keyid:20250817").unwrap(/* known good */),
            // With apologies to J.R.R. Tolkien, but I needed 64 bytes exactly.
            SigningKey::new(
                b"All that is gold does not glitter-- Not all who wander are lost.".to_vec(),
            )
            .unwrap(/* known good */),
        )
    }

    #[test]
    fn verify_minted_token() {
        let username = Username::new("johndoe").unwrap(/* known good */);
        let (key_id, signing_key) = keys();

        let token = mint_token(
            &username,
            &key_id,
            &signing_key,
            "quill.example.com",
            &Duration::seconds(300),
        )
        .unwrap();

        let keys = SigningKeys::from([(key_id, signing_key)]);
        let verified = verify_token(&token, &keys, "quill.example.com").unwrap();
        assert_eq!(username, verified);

        assert!(matches!(
            verify_token(&token, &keys, "elsewhere.example.com"),
            Err(Error::UnknownIssuer { .. })
        ));
    }

    #[test]
    fn reject_bad_tokens() {
        let username = Username::new("johndoe").unwrap(/* known good */);
        let (key_id, signing_key) = keys();

        let expired = mint_token(
            &username,
            &key_id,
            &signing_key,
            "quill.example.com",
            &Duration::seconds(-5),
        )
        .unwrap();
        let keys = SigningKeys::from([(key_id.clone(), signing_key.clone())]);
        assert!(matches!(
            verify_token(&expired, &keys, "quill.example.com"),
            Err(Error::Expired { .. })
        ));

        // Same key ID, different key: the signature won't check
        let forged = mint_token(
            &username,
            &key_id,
            &SigningKey::default(),
            "quill.example.com",
            &Duration::seconds(300),
        )
        .unwrap();
        assert!(matches!(
            verify_token(&forged, &keys, "quill.example.com"),
            Err(Error::Verification { .. })
        ));

        assert!(verify_token("not.a.token", &keys, "quill.example.com").is_err());
    }
}
