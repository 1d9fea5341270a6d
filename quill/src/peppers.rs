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

//! # quill peppers
//!
//! quill salts and [peppers] passwords. Salts are generated at signup time for each user & stored
//! along with that user's password hash. Peppers are kept *separately*, in configuration:
//!
//! [peppers]: https://cheatsheetseries.owasp.org/cheatsheets/Password_Storage_Cheat_Sheet.html#peppering
//!
//! ```toml
//! [peppers]
//! "pepper-ver:2025-02-12" = [1, 2, 3, 4, ..., 32] # Peppers must be 32 octets in length
//! "pepper-ver:2025-02-15" = [33, 34, 35, ..., 64]
//! ```
//!
//! To rotate, add a pepper with a later version (versions compare lexicographically) & restart
//! or SIGHUP the daemon. New users get the new pepper; extant users have the version they joined
//! under written down next to their hash, so they can continue to log in.

use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use snafu::{prelude::*, Backtrace};

use crate::util::Key;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid pepper version"))]
    BadVersion { text: String, backtrace: Backtrace },
    #[snafu(display("Peppers must be 32 octets in length; got {len}"))]
    BadPepperLength { len: usize, backtrace: Backtrace },
    #[snafu(display("No pepper available"))]
    NoPepper { backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        Pepper Versions                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    static ref VERSION: Regex = Regex::new("^pepper-ver:[-a-zA-Z0-9]+$").unwrap(/* known good */);
}

/// Correct-by-construction version string for peppers, of the form "pepper-ver:[-a-zA-Z0-9]+"
///
/// Versions are written down alongside user password hashes.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[serde(try_from = "String")]
pub struct Version(String);

impl Version {
    pub fn new(text: &str) -> Result<Version> {
        Version::try_from(text.to_owned())
    }
}

impl AsRef<str> for Version {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Version::new(s)
    }
}

impl TryFrom<String> for Version {
    type Error = Error;

    fn try_from(text: String) -> std::result::Result<Self, Self::Error> {
        if VERSION.is_match(&text) {
            Ok(Version(text))
        } else {
            BadVersionSnafu { text }.fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Pepper                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

const PEPPER_LENGTH: usize = 32;

/// A [Pepper] is a 32-octet [Key]
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "Key")]
pub struct Pepper(Key);

impl Pepper {
    pub fn random() -> Pepper {
        Pepper(Key::random(PEPPER_LENGTH))
    }
}

impl AsRef<Key> for Pepper {
    fn as_ref(&self) -> &Key {
        &self.0
    }
}

impl TryFrom<Key> for Pepper {
    type Error = Error;

    fn try_from(key: Key) -> std::result::Result<Self, Self::Error> {
        if key.len() == PEPPER_LENGTH {
            Ok(Pepper(key))
        } else {
            BadPepperLengthSnafu { len: key.len() }.fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Peppers                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
#[serde(transparent)]
pub struct Peppers {
    peppers: BTreeMap<Version, Pepper>,
}

impl Default for Peppers {
    fn default() -> Self {
        Peppers {
            peppers: BTreeMap::from_iter(vec![(
                Version(chrono::Local::now().format("pepper-ver:%Y%m%d").to_string()),
                Pepper::random(),
            )]),
        }
    }
}

impl<const N: usize> From<[(Version, Pepper); N]> for Peppers {
    fn from(value: [(Version, Pepper); N]) -> Self {
        Peppers {
            peppers: BTreeMap::from(value),
        }
    }
}

impl Peppers {
    /// Retrieve the current (i.e. the most recent) Pepper
    pub fn current_pepper(&self) -> Result<(Version, Pepper)> {
        let (key, value) = self.peppers.last_key_value().context(NoPepperSnafu)?;
        Ok((key.clone(), value.clone()))
    }
    /// Retrieve a pepper by version
    pub fn find_by_version(&self, version: &Version) -> Result<Pepper> {
        Ok(self.peppers.get(version).context(NoPepperSnafu)?.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn versions() {
        assert!(Version::new("pepper-ver:20250212").is_ok());
        assert!(Version::new("pepper-ver:").is_err());
        assert!(Version::new("20250212").is_err());
    }

    #[test]
    fn rotation() {
        let text = format!(
            "\"pepper-ver:a\" = {:?}\n\"pepper-ver:b\" = {:?}\n",
            vec![1u8; 32],
            vec![2u8; 32]
        );
        let peppers: Peppers = toml::from_str(&text).unwrap();
        let (version, _) = peppers.current_pepper().unwrap();
        assert_eq!(version.as_ref(), "pepper-ver:b");
        assert!(peppers
            .find_by_version(&Version::new("pepper-ver:a").unwrap())
            .is_ok());
        assert!(peppers
            .find_by_version(&Version::new("pepper-ver:c").unwrap())
            .is_err());

        let short = "\"pepper-ver:a\" = [1, 2, 3]";
        assert!(toml::from_str::<Peppers>(short).is_err());
    }
}
