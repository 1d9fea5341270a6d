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

//! # quill templates
//!
//! Every page quill serves is rendered by [Tera] from a template compiled into the binary, so a
//! deployment is a single executable (plus its configuration, database & media directory).

use snafu::{Backtrace, ResultExt, Snafu};
use tera::Tera;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to compile quill's templates: {source}"))]
    Compile {
        source: tera::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

const TEMPLATES: [(&str, &str); 13] = [
    ("base.html", include_str!("../templates/base.html")),
    (
        "includes/paginator.html",
        include_str!("../templates/includes/paginator.html"),
    ),
    (
        "includes/post_card.html",
        include_str!("../templates/includes/post_card.html"),
    ),
    ("index.html", include_str!("../templates/index.html")),
    ("group_list.html", include_str!("../templates/group_list.html")),
    ("profile.html", include_str!("../templates/profile.html")),
    ("follow.html", include_str!("../templates/follow.html")),
    ("post_detail.html", include_str!("../templates/post_detail.html")),
    ("create_post.html", include_str!("../templates/create_post.html")),
    ("login.html", include_str!("../templates/login.html")),
    ("signup.html", include_str!("../templates/signup.html")),
    ("404.html", include_str!("../templates/404.html")),
    ("500.html", include_str!("../templates/500.html")),
];

/// Compile the embedded templates
pub fn load() -> Result<Tera> {
    let mut tera = Tera::default();
    // `add_raw_templates` resolves inheritance across the whole batch, so the order above doesn't
    // matter.
    tera.add_raw_templates(TEMPLATES).context(CompileSnafu)?;
    Ok(tera)
}
