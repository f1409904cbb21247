//! Denormalized search text for one book.

use crate::Result;
use crate::storage::resolver::{load_book_authors, load_book_series, load_book_toc};
use crate::storage::sqlite::fold_for_search;
use crate::storage::statements::StatementCache;
use rusqlite::{Connection, ToSql, params};

/// One row of the search index, columns in `FTS_COLUMNS` order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SearchDocument {
    pub author_name: String,
    pub title: String,
    pub description: String,
    pub notes: String,
    pub publisher: String,
    pub genre: String,
    pub location: String,
    pub isbn: String,
}

impl SearchDocument {
    /// Parameters for `INSERT INTO <fts> (rowid, ...)`, book id first.
    pub fn insert_params<'a>(&'a self, book: &'a i64) -> [&'a dyn ToSql; 9] {
        [
            book,
            &self.author_name,
            &self.title,
            &self.description,
            &self.notes,
            &self.publisher,
            &self.genre,
            &self.location,
            &self.isbn,
        ]
    }

    fn fold(mut self) -> Self {
        for field in [
            &mut self.author_name,
            &mut self.title,
            &mut self.description,
            &mut self.notes,
            &mut self.publisher,
            &mut self.genre,
            &mut self.location,
            &mut self.isbn,
        ] {
            *field = fold_for_search(field);
        }
        self
    }
}

struct BookText {
    title: String,
    description: String,
    notes: String,
    publisher: String,
    genre: String,
    location: String,
    isbn: String,
}

/// Assembles the current search text of `book` from the row store.
///
/// Returns `None` when the book does not exist.
pub(crate) fn load_document(
    conn: &Connection,
    stmts: &mut StatementCache,
    book: i64,
) -> Result<Option<SearchDocument>> {
    let Some(fields) = stmts
        .get_or_add(
            conn,
            "search_book_text",
            "SELECT title, coalesce(description, ''), coalesce(notes, ''),
                    coalesce(publisher, ''), coalesce(genre, ''), coalesce(location, ''),
                    coalesce(isbn, '')
             FROM books WHERE _id = ?1",
        )?
        .query_row(conn, params![book], |row| {
            Ok(BookText {
                title: row.get(0)?,
                description: row.get(1)?,
                notes: row.get(2)?,
                publisher: row.get(3)?,
                genre: row.get(4)?,
                location: row.get(5)?,
                isbn: row.get(6)?,
            })
        })?
    else {
        return Ok(None);
    };

    let mut author_name = String::new();
    for author in load_book_authors(conn, stmts, book)? {
        author_name.push_str(&author.given_first());
        author_name.push(';');
    }

    let mut title = fields.title;
    title.push_str("; ");
    for entry in load_book_toc(conn, stmts, book)? {
        author_name.push_str(&entry.author.given_first());
        author_name.push(';');
        title.push_str(&entry.title);
        title.push(';');
    }

    let mut description = fields.description;
    for series in load_book_series(conn, stmts, book)? {
        description.push(' ');
        description.push_str(&series.search_text());
        description.push(';');
    }

    Ok(Some(
        SearchDocument {
            author_name,
            title,
            description,
            notes: fields.notes,
            publisher: fields.publisher,
            genre: fields.genre,
            location: fields.location,
            isbn: fields.isbn,
        }
        .fold(),
    ))
}
