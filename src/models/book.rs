//! The primary catalogue record.

use super::field::{ColumnDef, ColumnType, FieldValue, coerce};
use super::{Author, Bookshelf, Series, TocEntry, UNSAVED_ID};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Coercible columns of the `books` table.
///
/// Bookkeeping columns (`_id`, `book_uuid`, `last_update_date`, goodreads
/// sync state) are owned by the store and are not settable by name.
pub const BOOK_COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("title", ColumnType::Text, false),
    ColumnDef::new("isbn", ColumnType::Text, true),
    ColumnDef::new("publisher", ColumnType::Text, true),
    ColumnDef::new("date_published", ColumnType::Date, true),
    ColumnDef::new("rating", ColumnType::Real, false),
    ColumnDef::new("read", ColumnType::Boolean, false),
    ColumnDef::new("pages", ColumnType::Integer, true),
    ColumnDef::new("notes", ColumnType::Text, true),
    ColumnDef::new("list_price", ColumnType::Text, true),
    ColumnDef::new("anthology", ColumnType::Integer, false),
    ColumnDef::new("location", ColumnType::Text, true),
    ColumnDef::new("read_start", ColumnType::Date, true),
    ColumnDef::new("read_end", ColumnType::Date, true),
    ColumnDef::new("format", ColumnType::Text, true),
    ColumnDef::new("signed", ColumnType::Boolean, false),
    ColumnDef::new("description", ColumnType::Text, true),
    ColumnDef::new("genre", ColumnType::Text, true),
    ColumnDef::new("language", ColumnType::Text, true),
    ColumnDef::new("date_added", ColumnType::DateTime, true),
];

/// A book with its ordered associations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Book {
    /// Local row id, or [`UNSAVED_ID`].
    pub id: i64,
    /// Stable identity shared across stores. Assigned on first insert.
    pub uuid: String,
    /// Title.
    pub title: String,
    /// ISBN as entered.
    pub isbn: String,
    /// Publisher.
    pub publisher: String,
    /// Publication date (partial dates allowed).
    pub date_published: String,
    /// User rating.
    pub rating: f64,
    /// Whether the book has been read.
    pub read: bool,
    /// Page count.
    pub pages: Option<i64>,
    /// Personal notes.
    pub notes: String,
    /// List price, free text.
    pub list_price: String,
    /// Anthology bitmask (0 = not an anthology).
    pub anthology_mask: i64,
    /// Shelf location.
    pub location: String,
    /// Date reading started.
    pub read_start: String,
    /// Date reading finished.
    pub read_end: String,
    /// Physical format ("Paperback", "Audiobook"...).
    pub format: String,
    /// Whether the copy is signed.
    pub signed: bool,
    /// Description / blurb.
    pub description: String,
    /// Genre.
    pub genre: String,
    /// Language.
    pub language: String,
    /// When the book was added; defaults to insert time.
    pub date_added: Option<String>,
    /// Remote review-site id; reset by the store when the ISBN changes.
    pub goodreads_book_id: i64,
    /// Last remote sync date.
    pub last_goodreads_sync_date: String,
    /// Stamped by the store on every write.
    pub last_update_date: Option<String>,
    /// Ordered authors.
    pub authors: Vec<Author>,
    /// Ordered series.
    pub series: Vec<Series>,
    /// Ordered table of contents.
    pub toc: Vec<TocEntry>,
    /// Shelves the book is on.
    pub bookshelves: Vec<Bookshelf>,
}

impl Book {
    /// Creates an unsaved book with a title.
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: UNSAVED_ID,
            title: title.into(),
            ..Self::default()
        }
    }

    /// Adds an author (builder style).
    #[must_use]
    pub fn with_author(mut self, author: Author) -> Self {
        self.authors.push(author);
        self
    }

    /// Adds a series (builder style).
    #[must_use]
    pub fn with_series(mut self, series: Series) -> Self {
        self.series.push(series);
        self
    }

    /// Adds a TOC entry (builder style).
    #[must_use]
    pub fn with_toc_entry(mut self, entry: TocEntry) -> Self {
        self.toc.push(entry);
        self
    }

    /// Adds a bookshelf (builder style).
    #[must_use]
    pub fn with_bookshelf(mut self, shelf: Bookshelf) -> Self {
        self.bookshelves.push(shelf);
        self
    }

    /// Sets a column from raw text, coercing through [`BOOK_COLUMNS`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an unknown column or a value the
    /// column cannot hold.
    pub fn apply_field(&mut self, name: &str, raw: &str) -> Result<()> {
        let column = BOOK_COLUMNS
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown book field '{name}'")))?;
        let value = coerce(column, raw)?;

        match column.name {
            "title" => self.title = value.into_text(),
            "isbn" => self.isbn = value.into_text(),
            "publisher" => self.publisher = value.into_text(),
            "date_published" => self.date_published = value.into_text(),
            "rating" => self.rating = value.as_f64().unwrap_or_default(),
            "read" => self.read = value.as_bool(),
            "pages" => self.pages = value.as_i64(),
            "notes" => self.notes = value.into_text(),
            "list_price" => self.list_price = value.into_text(),
            "anthology" => self.anthology_mask = value.as_i64().unwrap_or_default(),
            "location" => self.location = value.into_text(),
            "read_start" => self.read_start = value.into_text(),
            "read_end" => self.read_end = value.into_text(),
            "format" => self.format = value.into_text(),
            "signed" => self.signed = value.as_bool(),
            "description" => self.description = value.into_text(),
            "genre" => self.genre = value.into_text(),
            "language" => self.language = value.into_text(),
            "date_added" => {
                self.date_added = match value {
                    FieldValue::Null => None,
                    other => Some(other.into_text()),
                };
            },
            other => {
                return Err(Error::InvalidInput(format!(
                    "book field '{other}' is not settable"
                )));
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_field_coerces() {
        let mut book = Book::new("Dune");
        book.apply_field("pages", "412").unwrap();
        book.apply_field("read", "t").unwrap();
        book.apply_field("rating", "4.5").unwrap();
        book.apply_field("date_published", "1965-08").unwrap();

        assert_eq!(book.pages, Some(412));
        assert!(book.read);
        assert!((book.rating - 4.5).abs() < f64::EPSILON);
        assert_eq!(book.date_published, "1965-08");
    }

    #[test]
    fn test_apply_field_unknown_column() {
        let mut book = Book::new("Dune");
        let err = book.apply_field("book_uuid", "abc").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(msg) if msg.contains("book_uuid")));
    }

    #[test]
    fn test_apply_field_rejects_bad_value() {
        let mut book = Book::new("Dune");
        assert!(book.apply_field("pages", "many").is_err());
        assert_eq!(book.pages, None);
    }

    #[test]
    fn test_every_column_is_settable() {
        let mut book = Book::new("x");
        for column in BOOK_COLUMNS {
            let sample = match column.column_type {
                ColumnType::Text => "text",
                ColumnType::Integer => "1",
                ColumnType::Real => "1.0",
                ColumnType::Boolean => "1",
                ColumnType::Date => "2001-01-01",
                ColumnType::DateTime => "2001-01-01 10:00:00",
            };
            book.apply_field(column.name, sample).unwrap();
        }
    }
}
