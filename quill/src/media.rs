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

//! # media
//!
//! Post images live on local disk under the configured media root, in `posts/`, & are served from
//! `/media/`. A post refers to its image by the path relative to the media root
//! (e.g. "posts/cat.jpg").

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use axum::body::Bytes;
use file_format::{FileFormat, Kind};
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to create the media directory {}: {source}", path.display()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to write {}: {source}", path.display()))]
    Write {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Sub-directory of the media root holding post images
const POST_IMAGES: &str = "posts";

/// A file submitted with a form
#[derive(Clone, Debug)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Bytes,
}

impl Upload {
    /// True if the upload's content (not its name) identifies it as an image
    pub fn is_image(&self) -> bool {
        !self.bytes.is_empty() && FileFormat::from_bytes(&self.bytes).kind() == Kind::Image
    }
}

/// Reduce a client-supplied file name to something safe to use on disk
fn sanitize(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim_start_matches('.');
    let clean: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(100)
        .collect();
    if clean.is_empty() {
        "upload".to_owned()
    } else {
        clean
    }
}

/// Where uploaded images are kept
#[derive(Clone, Debug)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> MediaStore {
        MediaStore { root: root.into() }
    }
    pub fn root(&self) -> &Path {
        &self.root
    }
    /// Write `upload` beneath `posts/`, never overwriting an existing file; return its path
    /// relative to the media root
    pub async fn save_post_image(&self, upload: &Upload) -> Result<String> {
        let dir = self.root.join(POST_IMAGES);
        fs::create_dir_all(&dir)
            .await
            .context(CreateDirSnafu { path: dir.clone() })?;

        let mut name = sanitize(&upload.file_name);
        loop {
            let path = dir.join(&name);
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(&upload.bytes)
                        .await
                        .context(WriteSnafu { path: path.clone() })?;
                    file.flush().await.context(WriteSnafu { path: path.clone() })?;
                    debug!("Saved {} bytes to {}", upload.bytes.len(), path.display());
                    return Ok(format!("{}/{}", POST_IMAGES, name));
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let suffix = Uuid::new_v4().simple().to_string();
                    name = format!("{}_{}", &suffix[..7], sanitize(&upload.file_name));
                }
                Err(err) => return Err(err).context(WriteSnafu { path }),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // The eight-byte PNG signature followed by the start of an IHDR chunk
    const PNG: &[u8] = &[
        0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
        0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn file_names() {
        assert_eq!(sanitize("cat.png"), "cat.png");
        assert_eq!(sanitize("../../etc/passwd"), "passwd");
        assert_eq!(sanitize("C:\\pics\\my cat.png"), "my_cat.png");
        assert_eq!(sanitize(".hidden"), "hidden");
        assert_eq!(sanitize(""), "upload");
    }

    #[test]
    fn image_detection() {
        let png = Upload {
            file_name: "x.png".to_owned(),
            bytes: Bytes::from_static(PNG),
        };
        assert!(png.is_image());
        let text = Upload {
            file_name: "x.png".to_owned(),
            bytes: Bytes::from_static(b"just some text, honest"),
        };
        assert!(!text.is_image());
    }

    #[tokio::test]
    async fn no_overwrites() {
        let root = tempfile::tempdir().unwrap();
        let store = MediaStore::new(root.path());
        let upload = Upload {
            file_name: "cat.png".to_owned(),
            bytes: Bytes::from_static(PNG),
        };
        let first = store.save_post_image(&upload).await.unwrap();
        let second = store.save_post_image(&upload).await.unwrap();
        assert_eq!(first, "posts/cat.png");
        assert_ne!(first, second);
        assert!(second.starts_with("posts/") && second.ends_with("_cat.png"));
        assert_eq!(std::fs::read(root.path().join(&second)).unwrap(), PNG);
    }
}
