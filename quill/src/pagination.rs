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

//! # pagination
//!
//! quill listings are served a fixed number of posts at a time. The page number comes from the
//! `page` query parameter & is forgiving: anything that isn't an integer selects the first page,
//! and numbers out of range are clamped to the nearest page that exists. An empty listing still
//! has one (empty) page.

use serde::{Deserialize, Serialize};

/// Number of posts per listing page, absent configuration
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// The query string of a listing request
///
/// `page` is kept as a string so that "?page=last" or "?page=" selects page one rather than
/// failing extraction.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<String>,
}

/// True if `s` is a run of decimal digits, optionally preceded by '+'
fn is_unsigned(s: &str) -> bool {
    let digits = s.strip_prefix('+').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// The slice of a listing selected by a page request
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Window {
    number: usize,
    num_pages: usize,
    count: usize,
    per_page: usize,
}

impl Window {
    /// Work out which page `requested` selects from a listing of `count` items
    pub fn new(requested: Option<&str>, count: usize, per_page: usize) -> Window {
        let per_page = per_page.max(1);
        let num_pages = count.div_ceil(per_page).max(1);
        let number = match requested.map(str::trim) {
            Some(s) => match s.parse::<i64>() {
                Ok(n) if n < 1 => 1,
                Ok(n) => usize::try_from(n).unwrap_or(usize::MAX).min(num_pages),
                // Still a page number, just too large to represent
                Err(_) if is_unsigned(s) => num_pages,
                Err(_) => 1,
            },
            None => 1,
        };
        Window {
            number,
            num_pages,
            count,
            per_page,
        }
    }
    pub fn count(&self) -> usize {
        self.count
    }
    pub fn has_next(&self) -> bool {
        self.number < self.num_pages
    }
    pub fn has_previous(&self) -> bool {
        self.number > 1
    }
    pub fn limit(&self) -> usize {
        self.per_page
    }
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }
    pub fn number(&self) -> usize {
        self.number
    }
    pub fn offset(&self) -> usize {
        (self.number - 1) * self.per_page
    }
}

/// One page of a listing, in the form templates consume
#[derive(Clone, Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub number: usize,
    pub num_pages: usize,
    pub count: usize,
    pub has_next: bool,
    pub has_previous: bool,
    pub next: Option<usize>,
    pub previous: Option<usize>,
    pub page_range: Vec<usize>,
}

impl<T> Page<T> {
    pub fn new(window: &Window, items: Vec<T>) -> Page<T> {
        Page {
            items,
            number: window.number(),
            num_pages: window.num_pages(),
            count: window.count(),
            has_next: window.has_next(),
            has_previous: window.has_previous(),
            next: window.has_next().then(|| window.number() + 1),
            previous: window.has_previous().then(|| window.number() - 1),
            page_range: (1..=window.num_pages()).collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn thirteen_posts() {
        let first = Window::new(None, 13, DEFAULT_PAGE_SIZE);
        assert_eq!(first.number(), 1);
        assert_eq!(first.num_pages(), 2);
        assert_eq!((first.offset(), first.limit()), (0, 10));
        assert!(first.has_next());
        assert!(!first.has_previous());

        let second = Window::new(Some("2"), 13, DEFAULT_PAGE_SIZE);
        assert_eq!(second.offset(), 10);
        assert!(!second.has_next());
        assert!(second.has_previous());

        let page = Page::new(&second, vec![11, 12, 13]);
        assert_eq!(page.previous, Some(1));
        assert_eq!(page.next, None);
        assert_eq!(page.page_range, vec![1, 2]);
    }

    #[test]
    fn clamping() {
        assert_eq!(Window::new(Some("0"), 13, 10).number(), 1);
        assert_eq!(Window::new(Some("-4"), 13, 10).number(), 1);
        assert_eq!(Window::new(Some("99"), 13, 10).number(), 2);
        assert_eq!(Window::new(Some("99999999999999999999"), 13, 10).number(), 2);
        assert_eq!(Window::new(Some("+99999999999999999999"), 13, 10).number(), 2);
        assert_eq!(Window::new(Some("-99999999999999999999"), 13, 10).number(), 1);
        assert_eq!(Window::new(Some("last"), 13, 10).number(), 1);
        assert_eq!(Window::new(Some(""), 13, 10).number(), 1);
    }

    #[test]
    fn empty_listing() {
        let window = Window::new(Some("3"), 0, 10);
        assert_eq!(window.number(), 1);
        assert_eq!(window.num_pages(), 1);
        assert_eq!(window.offset(), 0);
        assert!(!window.has_next());
        assert!(!window.has_previous());
    }
}
