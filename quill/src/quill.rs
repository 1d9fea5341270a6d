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

use std::{sync::Arc, time::Duration as StdDuration};

use chrono::Duration;
use tera::Tera;

use crate::{
    cache::PageCache, media::MediaStore, metrics::Instruments, peppers::Peppers,
    signing_keys::SigningKeys, storage::Backend as StorageBackend,
};

/// Application state available to all handlers
pub struct Quill {
    pub storage: Arc<dyn StorageBackend + Send + Sync>,
    pub page_cache: Arc<dyn PageCache + Send + Sync>,
    pub templates: Tera,
    pub instruments: Arc<Instruments>,
    pub peppers: Peppers,
    pub signing_keys: SigningKeys,
    /// Names this site in session tokens
    pub issuer: String,
    pub session_lifetime: Duration,
    pub secure_cookies: bool,
    pub page_size: usize,
    pub cache_ttl: StdDuration,
    pub media: MediaStore,
}
