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

//! # quill configuration
//!
//! Shared by `quilld` & `quill-admin`. The configuration file is TOML, versioned (via a `version`
//! key) so that its format can evolve. Every setting has a default, & if no file is named and the
//! default location doesn't exist, the defaults are used wholesale.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;
use snafu::{IntoError, Snafu};

use crate::{peppers::Peppers, signing_keys::SigningKeys};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unable to read configuration file {}: {source}", pth.display()))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file {}: {source}", pth.display()))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Where quill looks for its configuration when none is named
pub const DEFAULT_CONFIG: &str = "/etc/quill.toml";

/// The relational datastore
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. "sqlite:///var/lib/quill/quill.db"
    pub url: String,
    #[serde(rename = "max-connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            url: "sqlite://quill.db".to_owned(),
            max_connections: 5,
        }
    }
}

/// quill configuration, version one
// Nb that we can only deserialize (i.e. not serialize) due to the presence of secrets in the
// struct
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConfigV1 {
    /// Log to this file rather than stdout
    #[serde(rename = "log-file")]
    pub log_file: Option<PathBuf>,
    /// Local address at which to serve the site; specify as "address:port"
    #[serde(rename = "public-address")]
    pub public_address: SocketAddr,
    /// Address at which to serve health checks, metrics & operator requests
    #[serde(rename = "private-address")]
    pub private_address: SocketAddr,
    /// The name under which this site is reached; session tokens are issued in this name
    #[serde(rename = "public-host")]
    pub public_host: String,
    pub database: DatabaseConfig,
    pub pepper: Peppers,
    #[serde(rename = "signing-keys")]
    pub signing_keys: SigningKeys,
    /// Session lifetime, in seconds
    #[serde(rename = "session-lifetime")]
    pub session_lifetime: i64,
    /// Mark the session cookie `Secure` (do this whenever the site is served over TLS)
    #[serde(rename = "secure-cookies")]
    pub secure_cookies: bool,
    #[serde(rename = "page-size")]
    pub page_size: usize,
    /// Page cache lifetime, in seconds
    #[serde(rename = "cache-ttl")]
    pub cache_ttl: u64,
    /// Maximum number of pages in the page cache
    #[serde(rename = "cache-capacity")]
    pub cache_capacity: usize,
    /// Directory beneath which uploaded images are kept
    #[serde(rename = "media-root")]
    pub media_root: PathBuf,
    /// Largest request body accepted, in bytes
    #[serde(rename = "max-upload-size")]
    pub max_upload_size: usize,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            log_file: None,
            public_address: "0.0.0.0:20690".parse::<SocketAddr>().unwrap(/* known good */),
            private_address: "127.0.0.1:20691".parse::<SocketAddr>().unwrap(/* known good */),
            public_host: "localhost:20690".to_owned(),
            database: DatabaseConfig::default(),
            pepper: Peppers::default(),
            signing_keys: SigningKeys::default(),
            session_lifetime: 14 * 24 * 60 * 60,
            secure_cookies: false,
            page_size: crate::pagination::DEFAULT_PAGE_SIZE,
            cache_ttl: 20,
            cache_capacity: crate::cache::DEFAULT_CAPACITY,
            media_root: PathBuf::from("media"),
            max_upload_size: 10 * 1024 * 1024,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse configuration text
pub fn parse_config_text(text: &str, pth: &Path) -> Result<ConfigV1> {
    match toml::from_str::<Configuration>(text) {
        Ok(Configuration::V1(cfg)) => Ok(cfg),
        Err(err) => Err(ConfigParseSnafu {
            pth: pth.to_path_buf(),
        }
        .into_error(err)),
    }
}

/// Parse the quill configuration file
///
/// If `cfg` is `None`, [DEFAULT_CONFIG] is tried; if *that* doesn't exist, the defaults are
/// returned.
pub fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from_str(DEFAULT_CONFIG).unwrap(/* known good */), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => parse_config_text(&text, &pth),
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_config() {
        let cfg = parse_config_text(
            r#"
version = "1"
public-host = "quill.example.com"
cache-ttl = 5

[database]
url = "sqlite:///var/lib/quill/quill.db"
"#,
            Path::new("test.toml"),
        )
        .unwrap();
        assert_eq!(cfg.public_host, "quill.example.com");
        assert_eq!(cfg.cache_ttl, 5);
        assert_eq!(cfg.database.url, "sqlite:///var/lib/quill/quill.db");
        assert_eq!(cfg.database.max_connections, 5);
        assert_eq!(cfg.page_size, 10);
        assert!(cfg.signing_keys.current().is_ok());
    }

    #[test]
    fn unknown_version() {
        assert!(matches!(
            parse_config_text("version = \"2\"\n", Path::new("test.toml")),
            Err(Error::ConfigParse { .. })
        ));
    }

    #[test]
    fn missing_named_file() {
        assert!(matches!(
            parse_config(&Some(PathBuf::from("/no/such/quill.toml"))),
            Err(Error::ConfigNotFound { .. })
        ));
    }
}
