//! Normalized catalogue entities.
//!
//! Each entity carries a surrogate `id` (0 until resolved against a store)
//! plus the natural key used for de-duplication.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Surrogate id of a row that has not been resolved against a store yet.
pub const UNSAVED_ID: i64 = 0;

/// A book author, keyed by family and given names.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Author {
    /// Row id, or [`UNSAVED_ID`].
    pub id: i64,
    /// Family (last) name.
    pub family_name: String,
    /// Given (first) names. May be empty.
    pub given_names: String,
}

impl Author {
    /// Creates an unsaved author.
    #[must_use]
    pub fn new(family_name: impl Into<String>, given_names: impl Into<String>) -> Self {
        Self {
            id: UNSAVED_ID,
            family_name: family_name.into(),
            given_names: given_names.into(),
        }
    }

    /// "Given Family", as used in search text.
    #[must_use]
    pub fn given_first(&self) -> String {
        format!("{} {}", self.given_names, self.family_name)
    }
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.given_names.is_empty() {
            write!(f, "{}", self.family_name)
        } else {
            write!(f, "{}, {}", self.family_name, self.given_names)
        }
    }
}

/// A series. The `number` is per-book link data, not part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Series {
    /// Row id, or [`UNSAVED_ID`].
    pub id: i64,
    /// Series name.
    pub name: String,
    /// Position of the book within the series ("3", "1.5", "II"...).
    pub number: String,
}

impl Series {
    /// Creates an unsaved series reference.
    #[must_use]
    pub fn new(name: impl Into<String>, number: impl Into<String>) -> Self {
        Self {
            id: UNSAVED_ID,
            name: name.into(),
            number: number.into(),
        }
    }

    /// "Name number", as used in search text.
    #[must_use]
    pub fn search_text(&self) -> String {
        format!("{} {}", self.name, self.number)
    }
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.number.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} #{}", self.name, self.number)
        }
    }
}

/// A bookshelf.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bookshelf {
    /// Row id, or [`UNSAVED_ID`].
    pub id: i64,
    /// Shelf name.
    pub name: String,
}

impl Bookshelf {
    /// Name of the shelf every fresh store starts with.
    pub const DEFAULT_NAME: &'static str = "Default";

    /// Creates an unsaved bookshelf.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: UNSAVED_ID,
            name: name.into(),
        }
    }
}

/// A table-of-contents entry (one story in an anthology).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TocEntry {
    /// Row id, or [`UNSAVED_ID`].
    pub id: i64,
    /// Author of this entry.
    pub author: Author,
    /// Title of this entry.
    pub title: String,
}

impl TocEntry {
    /// Creates an unsaved entry.
    #[must_use]
    pub fn new(author: Author, title: impl Into<String>) -> Self {
        Self {
            id: UNSAVED_ID,
            author,
            title: title.into(),
        }
    }
}
