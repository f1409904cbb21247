//! Identity resolution for normalized entities.
//!
//! Authors, series and bookshelves are looked up by their natural key under
//! the `LOCALIZED` collation, never by a caller-supplied id. A stale id on
//! the input is simply overwritten.

use super::association::{
    self, BOOK_AUTHOR, BOOK_SERIES, linked_books, replace_bookshelf_links, replace_toc_author,
};
use super::books::mark_books_dirty;
use super::session::Session;
use super::statements::StatementCache;
use crate::models::{Author, Bookshelf, Series, TocEntry};
use crate::{Error, Result};
use rusqlite::{Connection, Row, ToSql, params};
use tracing::instrument;

/// An entity with a natural key that resolves to a row id.
pub(crate) trait Resolvable: Sized {
    /// Logical name and SQL of the key lookup.
    const FIND: (&'static str, &'static str);
    /// Logical name and SQL of the insert. Binds the same parameters as
    /// [`FIND`](Self::FIND).
    const INSERT: (&'static str, &'static str);

    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
    /// Trims the key fields to the form they are stored in.
    fn normalize(&mut self);
    fn validate(&self) -> Result<()>;
    fn key_params(&self) -> Vec<&dyn ToSql>;
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
    /// Copies the stored key fields (and id) onto `self`, keeping link data.
    fn refresh_from(&mut self, stored: Self);
}

fn trim_in_place(value: &mut String) {
    let trimmed = value.trim();
    if trimmed.len() != value.len() {
        *value = trimmed.to_string();
    }
}

fn require_text(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{kind} name must not be empty")));
    }
    Ok(())
}

impl Resolvable for Author {
    const FIND: (&'static str, &'static str) = (
        "find_author",
        "SELECT _id, family_name, given_names FROM authors
         WHERE family_name = ?1 COLLATE LOCALIZED AND given_names = ?2 COLLATE LOCALIZED
         ORDER BY _id LIMIT 1",
    );
    const INSERT: (&'static str, &'static str) = (
        "insert_author",
        "INSERT INTO authors (family_name, given_names) VALUES (?1, ?2)",
    );

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn normalize(&mut self) {
        trim_in_place(&mut self.family_name);
        trim_in_place(&mut self.given_names);
    }

    fn validate(&self) -> Result<()> {
        require_text("author family", &self.family_name)
    }

    fn key_params(&self) -> Vec<&dyn ToSql> {
        vec![&self.family_name, &self.given_names]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            family_name: row.get(1)?,
            given_names: row.get(2)?,
        })
    }

    fn refresh_from(&mut self, stored: Self) {
        *self = stored;
    }
}

impl Resolvable for Series {
    const FIND: (&'static str, &'static str) = (
        "find_series",
        "SELECT _id, series_name FROM series WHERE series_name = ?1 COLLATE LOCALIZED
         ORDER BY _id LIMIT 1",
    );
    const INSERT: (&'static str, &'static str) =
        ("insert_series", "INSERT INTO series (series_name) VALUES (?1)");

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn normalize(&mut self) {
        trim_in_place(&mut self.name);
    }

    fn validate(&self) -> Result<()> {
        require_text("series", &self.name)
    }

    fn key_params(&self) -> Vec<&dyn ToSql> {
        vec![&self.name]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            number: String::new(),
        })
    }

    fn refresh_from(&mut self, stored: Self) {
        self.id = stored.id;
        self.name = stored.name;
    }
}

impl Resolvable for Bookshelf {
    const FIND: (&'static str, &'static str) = (
        "find_bookshelf",
        "SELECT _id, bookshelf FROM bookshelf WHERE bookshelf = ?1 COLLATE LOCALIZED
         ORDER BY _id LIMIT 1",
    );
    const INSERT: (&'static str, &'static str) =
        ("insert_bookshelf", "INSERT INTO bookshelf (bookshelf) VALUES (?1)");

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn normalize(&mut self) {
        trim_in_place(&mut self.name);
    }

    fn validate(&self) -> Result<()> {
        require_text("bookshelf", &self.name)
    }

    fn key_params(&self) -> Vec<&dyn ToSql> {
        vec![&self.name]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    }

    fn refresh_from(&mut self, stored: Self) {
        *self = stored;
    }
}

fn find<E: Resolvable>(conn: &Connection, stmts: &mut StatementCache, entity: &E) -> Result<Option<E>> {
    let (name, sql) = E::FIND;
    stmts
        .get_or_add(conn, name, sql)?
        .query_row(conn, &entity.key_params(), E::from_row)
}

/// Looks `entity` up by key and writes the stored id back.
///
/// The key fields are trimmed first. With `refresh`, the stored spelling of
/// the key replaces the caller's. Returns `None`, leaving the id untouched,
/// when nothing matches.
pub(crate) fn resolve<E: Resolvable>(
    conn: &Connection,
    stmts: &mut StatementCache,
    entity: &mut E,
    refresh: bool,
) -> Result<Option<i64>> {
    entity.normalize();
    entity.validate()?;
    let Some(stored) = find(conn, stmts, entity)? else {
        return Ok(None);
    };
    let id = stored.id();
    if refresh {
        entity.refresh_from(stored);
    } else {
        entity.set_id(id);
    }
    Ok(Some(id))
}

/// As [`resolve`], inserting the entity when it is not stored yet.
pub(crate) fn resolve_or_create<E: Resolvable>(
    conn: &Connection,
    stmts: &mut StatementCache,
    entity: &mut E,
    refresh: bool,
) -> Result<i64> {
    if let Some(id) = resolve(conn, stmts, entity, refresh)? {
        return Ok(id);
    }
    let (name, sql) = E::INSERT;
    let id = stmts
        .get_or_add(conn, name, sql)?
        .insert(conn, &entity.key_params())?;
    entity.set_id(id);
    tracing::debug!(statement = name, id, "entity created");
    Ok(id)
}

/// Rows removed by [`Session::purge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    /// Authors with no books and no table-of-contents entries.
    pub authors: usize,
    /// Series with no books.
    pub series: usize,
}

const AUTHOR_COLUMNS: &str = "a._id, a.family_name, a.given_names";

fn author_from_offset(row: &Row<'_>, offset: usize) -> rusqlite::Result<Author> {
    Ok(Author {
        id: row.get(offset)?,
        family_name: row.get(offset + 1)?,
        given_names: row.get(offset + 2)?,
    })
}

const RENAME_AUTHOR: (&str, &str) = (
    "update_author",
    "UPDATE authors SET family_name = ?1, given_names = ?2 WHERE _id = ?3",
);
const RENAME_SERIES: (&str, &str) = ("update_series", "UPDATE series SET series_name = ?1 WHERE _id = ?2");

/// Stores `name`'s spelling on author row `id`.
fn rename_author(conn: &Connection, stmts: &mut StatementCache, id: i64, name: &Author) -> Result<usize> {
    let (stmt, sql) = RENAME_AUTHOR;
    stmts
        .get_or_add(conn, stmt, sql)?
        .execute(conn, params![name.family_name.trim(), name.given_names.trim(), id])
}

/// Points every book and table-of-contents link of author `from` at `to`,
/// then deletes `from`.
fn merge_author_rows(conn: &Connection, stmts: &mut StatementCache, from: i64, to: i64) -> Result<()> {
    replace_toc_author(conn, from, to)?;
    association::global_replace_positioned(conn, BOOK_AUTHOR, from, to)?;
    stmts
        .get_or_add(conn, "delete_author", "DELETE FROM authors WHERE _id = ?1")?
        .execute(conn, params![from])?;
    Ok(())
}

fn rename_series(conn: &Connection, stmts: &mut StatementCache, id: i64, name: &Series) -> Result<usize> {
    let (stmt, sql) = RENAME_SERIES;
    stmts
        .get_or_add(conn, stmt, sql)?
        .execute(conn, params![name.name.trim(), id])
}

fn merge_series_rows(conn: &Connection, stmts: &mut StatementCache, from: i64, to: i64) -> Result<()> {
    association::global_replace_positioned(conn, BOOK_SERIES, from, to)?;
    stmts
        .get_or_add(conn, "delete_series", "DELETE FROM series WHERE _id = ?1")?
        .execute(conn, params![from])?;
    Ok(())
}

fn series_books(conn: &Connection, series: i64) -> Result<Vec<i64>> {
    linked_books(conn, "book_series", "series_id", series)
}

fn row_exists(conn: &Connection, stmts: &mut StatementCache, name: &'static str, sql: &str, id: i64) -> Result<bool> {
    Ok(stmts
        .get_or_add(conn, name, sql)?
        .query_row(conn, params![id], |_| Ok(()))?
        .is_some())
}

/// Books whose author data (direct or through the table of contents)
/// mentions `author`.
fn books_by_author(conn: &Connection, author: i64) -> Result<Vec<i64>> {
    let mut books = linked_books(conn, "book_author", "author", author)?;
    books.extend(linked_books(conn, "anthology", "author", author)?);
    books.sort_unstable();
    books.dedup();
    Ok(books)
}

impl Session<'_> {
    /// Looks an author up by name, writing the stored id and spelling back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty family name.
    #[instrument(skip(self, author), fields(operation = "resolve_author", backend = "sqlite"))]
    pub fn resolve_author(&self, author: &mut Author) -> Result<Option<i64>> {
        self.read("resolve_author", |conn, stmts| resolve(conn, stmts, author, true))
    }

    /// Resolves an author, creating it when unknown.
    ///
    /// # Errors
    ///
    /// As for [`resolve_author`](Self::resolve_author).
    #[instrument(skip(self, author), fields(operation = "resolve_or_create_author", backend = "sqlite"))]
    pub fn resolve_or_create_author(&self, author: &mut Author) -> Result<i64> {
        self.write("resolve_or_create_author", |conn, stmts| {
            resolve_or_create(conn, stmts, author, true)
        })
    }

    /// Fetches an author by id.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    pub fn get_author(&self, id: i64) -> Result<Option<Author>> {
        self.read("get_author", |conn, stmts| {
            stmts
                .get_or_add(
                    conn,
                    "get_author",
                    "SELECT _id, family_name, given_names FROM authors WHERE _id = ?1",
                )?
                .query_row(conn, params![id], Author::from_row)
        })
    }

    /// Every author, ordered by family then given names.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    pub fn authors(&self) -> Result<Vec<Author>> {
        self.read("list_authors", |conn, stmts| {
            stmts
                .get_or_add(
                    conn,
                    "list_authors",
                    "SELECT _id, family_name, given_names FROM authors
                     ORDER BY family_name COLLATE LOCALIZED, given_names COLLATE LOCALIZED",
                )?
                .query_map(conn, params![], Author::from_row)
        })
    }

    /// Rewrites a stored author's name and marks its books changed.
    ///
    /// When the new name already belongs to another author, this author is
    /// merged into that one, which takes the given spelling; `author.id` then
    /// becomes the surviving id. Returns false when no author has
    /// `author.id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty family name.
    #[instrument(skip(self, author), fields(operation = "update_author", backend = "sqlite", id = author.id))]
    pub fn update_author(&self, author: &mut Author) -> Result<bool> {
        let mut staged = author.clone();
        staged.normalize();
        staged.validate()?;
        let id = staged.id;
        let survivor = self.write("update_author", |conn, stmts| {
            if !row_exists(conn, stmts, "author_exists", "SELECT 1 FROM authors WHERE _id = ?1", id)? {
                return Ok(None);
            }
            let mut key = staged.clone();
            let target = match resolve(conn, stmts, &mut key, false)? {
                Some(other) if other != id => {
                    merge_author_rows(conn, stmts, id, other)?;
                    tracing::info!(from = id, to = other, "renamed author merged into existing one");
                    other
                },
                _ => id,
            };
            rename_author(conn, stmts, target, &staged)?;
            mark_books_dirty(conn, stmts, &books_by_author(conn, target)?)?;
            Ok(Some(target))
        })?;
        let Some(target) = survivor else {
            return Ok(false);
        };
        staged.id = target;
        *author = staged;
        Ok(true)
    }

    /// Ordered authors of `book`.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    pub fn book_authors(&self, book: i64) -> Result<Vec<Author>> {
        self.read("book_authors", |conn, stmts| load_book_authors(conn, stmts, book))
    }

    /// Merges author `from` into `to` across every book and table of
    /// contents, then deletes `from`.
    ///
    /// `to` is created when unknown. When both resolve to the same row the
    /// merge is a rename: the stored name takes `to`'s spelling.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when `from` is unknown or a name is
    /// empty.
    #[instrument(skip(self, from, to), fields(operation = "global_replace_author", backend = "sqlite"))]
    pub fn global_replace_author(&self, from: &Author, to: &mut Author) -> Result<()> {
        self.write("global_replace_author", |conn, stmts| {
            let mut source = from.clone();
            let Some(from_id) = resolve(conn, stmts, &mut source, false)? else {
                return Err(Error::InvalidInput(format!("unknown author '{from}'")));
            };

            let to_id = resolve_or_create(conn, stmts, to, false)?;
            let books = books_by_author(conn, from_id)?;

            if to_id == from_id {
                rename_author(conn, stmts, to_id, to)?;
            } else {
                merge_author_rows(conn, stmts, from_id, to_id)?;
            }

            mark_books_dirty(conn, stmts, &books)?;
            tracing::info!(from = from_id, to = to_id, books = books.len(), "authors merged");
            Ok(())
        })
    }

    /// Looks a series up by name, writing the stored id and spelling back.
    /// The caller's series number is kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty name.
    #[instrument(skip(self, series), fields(operation = "resolve_series", backend = "sqlite"))]
    pub fn resolve_series(&self, series: &mut Series) -> Result<Option<i64>> {
        self.read("resolve_series", |conn, stmts| resolve(conn, stmts, series, true))
    }

    /// Resolves a series, creating it when unknown.
    ///
    /// # Errors
    ///
    /// As for [`resolve_series`](Self::resolve_series).
    #[instrument(skip(self, series), fields(operation = "resolve_or_create_series", backend = "sqlite"))]
    pub fn resolve_or_create_series(&self, series: &mut Series) -> Result<i64> {
        self.write("resolve_or_create_series", |conn, stmts| {
            resolve_or_create(conn, stmts, series, true)
        })
    }

    /// Fetches a series by id (with an empty number).
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    pub fn get_series(&self, id: i64) -> Result<Option<Series>> {
        self.read("get_series", |conn, stmts| {
            stmts
                .get_or_add(conn, "get_series", "SELECT _id, series_name FROM series WHERE _id = ?1")?
                .query_row(conn, params![id], Series::from_row)
        })
    }

    /// Every series, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    pub fn all_series(&self) -> Result<Vec<Series>> {
        self.read("list_series", |conn, stmts| {
            stmts
                .get_or_add(
                    conn,
                    "list_series",
                    "SELECT _id, series_name FROM series ORDER BY series_name COLLATE LOCALIZED",
                )?
                .query_map(conn, params![], Series::from_row)
        })
    }

    /// Renames a stored series and marks its books changed.
    ///
    /// A name already used by another series merges this one into it, as
    /// for [`update_author`](Self::update_author).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty name.
    #[instrument(skip(self, series), fields(operation = "update_series", backend = "sqlite", id = series.id))]
    pub fn update_series(&self, series: &mut Series) -> Result<bool> {
        let mut staged = series.clone();
        staged.normalize();
        staged.validate()?;
        let id = staged.id;
        let survivor = self.write("update_series", |conn, stmts| {
            if !row_exists(conn, stmts, "series_exists", "SELECT 1 FROM series WHERE _id = ?1", id)? {
                return Ok(None);
            }
            let mut key = staged.clone();
            let target = match resolve(conn, stmts, &mut key, false)? {
                Some(other) if other != id => {
                    merge_series_rows(conn, stmts, id, other)?;
                    tracing::info!(from = id, to = other, "renamed series merged into existing one");
                    other
                },
                _ => id,
            };
            rename_series(conn, stmts, target, &staged)?;
            mark_books_dirty(conn, stmts, &series_books(conn, target)?)?;
            Ok(Some(target))
        })?;
        let Some(target) = survivor else {
            return Ok(false);
        };
        staged.id = target;
        *series = staged;
        Ok(true)
    }

    /// Ordered series of `book`, each with its number for that book.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    pub fn book_series(&self, book: i64) -> Result<Vec<Series>> {
        self.read("book_series", |conn, stmts| load_book_series(conn, stmts, book))
    }

    /// Merges series `from` into `to`, then deletes `from`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when `from` is unknown or a name is
    /// empty.
    #[instrument(skip(self, from, to), fields(operation = "global_replace_series", backend = "sqlite"))]
    pub fn global_replace_series(&self, from: &Series, to: &mut Series) -> Result<()> {
        self.write("global_replace_series", |conn, stmts| {
            let mut source = from.clone();
            let Some(from_id) = resolve(conn, stmts, &mut source, false)? else {
                return Err(Error::InvalidInput(format!("unknown series '{}'", from.name)));
            };
            let to_id = resolve_or_create(conn, stmts, to, false)?;
            let books = series_books(conn, from_id)?;

            if to_id == from_id {
                rename_series(conn, stmts, to_id, to)?;
            } else {
                merge_series_rows(conn, stmts, from_id, to_id)?;
            }

            mark_books_dirty(conn, stmts, &books)?;
            tracing::info!(from = from_id, to = to_id, books = books.len(), "series merged");
            Ok(())
        })
    }

    /// Resolves a bookshelf by name, creating it when unknown.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty name.
    #[instrument(skip(self, shelf), fields(operation = "resolve_or_create_bookshelf", backend = "sqlite"))]
    pub fn resolve_or_create_bookshelf(&self, shelf: &mut Bookshelf) -> Result<i64> {
        self.write("resolve_or_create_bookshelf", |conn, stmts| {
            resolve_or_create(conn, stmts, shelf, true)
        })
    }

    /// Every bookshelf, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    pub fn bookshelves(&self) -> Result<Vec<Bookshelf>> {
        self.read("list_bookshelves", |conn, stmts| {
            stmts
                .get_or_add(
                    conn,
                    "list_bookshelves",
                    "SELECT _id, bookshelf FROM bookshelf ORDER BY bookshelf COLLATE LOCALIZED",
                )?
                .query_map(conn, params![], Bookshelf::from_row)
        })
    }

    /// Shelves holding `book`.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    pub fn book_bookshelves(&self, book: i64) -> Result<Vec<Bookshelf>> {
        self.read("book_bookshelves", |conn, stmts| load_book_bookshelves(conn, stmts, book))
    }

    /// Moves every book from shelf `from` to `to` and deletes `from`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when `from` is unknown.
    #[instrument(skip(self, from, to), fields(operation = "global_replace_bookshelf", backend = "sqlite"))]
    pub fn global_replace_bookshelf(&self, from: &Bookshelf, to: &mut Bookshelf) -> Result<()> {
        self.write("global_replace_bookshelf", |conn, stmts| {
            let mut source = from.clone();
            let Some(from_id) = resolve(conn, stmts, &mut source, false)? else {
                return Err(Error::InvalidInput(format!("unknown bookshelf '{}'", from.name)));
            };
            let to_id = resolve_or_create(conn, stmts, to, false)?;
            if to_id == from_id {
                return Ok(());
            }
            replace_bookshelf_links(conn, from_id, to_id)?;
            stmts
                .get_or_add(conn, "delete_bookshelf", "DELETE FROM bookshelf WHERE _id = ?1")?
                .execute(conn, params![from_id])?;
            Ok(())
        })
    }

    /// Ordered table of contents of `book`.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    pub fn book_toc(&self, book: i64) -> Result<Vec<TocEntry>> {
        self.read("book_toc", |conn, stmts| load_book_toc(conn, stmts, book))
    }

    /// Deletes authors and series no longer referenced by any book.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    #[instrument(skip(self), fields(operation = "purge", backend = "sqlite"))]
    pub fn purge(&self) -> Result<PurgeCounts> {
        self.write("purge", |conn, stmts| {
            let authors = stmts
                .get_or_add(
                    conn,
                    "purge_authors",
                    "DELETE FROM authors
                     WHERE _id NOT IN (SELECT DISTINCT author FROM book_author)
                       AND _id NOT IN (SELECT DISTINCT author FROM anthology)",
                )?
                .execute(conn, params![])?;
            let series = stmts
                .get_or_add(
                    conn,
                    "purge_series",
                    "DELETE FROM series
                     WHERE _id NOT IN (SELECT DISTINCT series_id FROM book_series
                                       WHERE series_id IS NOT NULL)",
                )?
                .execute(conn, params![])?;
            let counts = PurgeCounts { authors, series };
            tracing::info!(authors, series, "purged unreferenced entities");
            Ok(counts)
        })
    }
}

pub(crate) fn load_book_authors(conn: &Connection, stmts: &mut StatementCache, book: i64) -> Result<Vec<Author>> {
    stmts
        .get_or_add(
            conn,
            "book_authors",
            &format!(
                "SELECT {AUTHOR_COLUMNS} FROM book_author ba JOIN authors a ON a._id = ba.author
                 WHERE ba.book = ?1 ORDER BY ba.author_position"
            ),
        )?
        .query_map(conn, params![book], |row| author_from_offset(row, 0))
}

pub(crate) fn load_book_series(conn: &Connection, stmts: &mut StatementCache, book: i64) -> Result<Vec<Series>> {
    stmts
        .get_or_add(
            conn,
            "book_series",
            "SELECT s._id, s.series_name, coalesce(bs.series_num, '')
             FROM book_series bs JOIN series s ON s._id = bs.series_id
             WHERE bs.book = ?1 ORDER BY bs.series_position",
        )?
        .query_map(conn, params![book], |row| {
            Ok(Series {
                id: row.get(0)?,
                name: row.get(1)?,
                number: row.get(2)?,
            })
        })
}

pub(crate) fn load_book_bookshelves(
    conn: &Connection,
    stmts: &mut StatementCache,
    book: i64,
) -> Result<Vec<Bookshelf>> {
    stmts
        .get_or_add(
            conn,
            "book_bookshelves",
            "SELECT DISTINCT s._id, s.bookshelf FROM book_bookshelf_weak w
             JOIN bookshelf s ON s._id = w.bookshelf
             WHERE w.book = ?1 ORDER BY s.bookshelf COLLATE LOCALIZED",
        )?
        .query_map(conn, params![book], Bookshelf::from_row)
}

pub(crate) fn load_book_toc(conn: &Connection, stmts: &mut StatementCache, book: i64) -> Result<Vec<TocEntry>> {
    stmts
        .get_or_add(
            conn,
            "book_toc",
            &format!(
                "SELECT an._id, an.title, {AUTHOR_COLUMNS} FROM anthology an
                 JOIN authors a ON a._id = an.author
                 WHERE an.book = ?1 ORDER BY an.position"
            ),
        )?
        .query_map(conn, params![book], |row| {
            Ok(TocEntry {
                id: row.get(0)?,
                title: row.get(1)?,
                author: author_from_offset(row, 2)?,
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CatalogueDb;
    use crate::{Book, StoreConfig};

    fn db() -> CatalogueDb {
        CatalogueDb::in_memory(StoreConfig::default()).unwrap()
    }

    #[test]
    fn test_resolution_ignores_case_and_accents() {
        let db = db();
        let session = db.session();
        let mut stored = Author::new("Smith", "John");
        let id = session.resolve_or_create_author(&mut stored).unwrap();

        let mut probe = Author::new("smith", "JOHN");
        probe.id = 9999;
        assert_eq!(session.resolve_author(&mut probe).unwrap(), Some(id));
        assert_eq!(probe, Author { id, ..Author::new("Smith", "John") });

        let mut accented = Author::new("Brontë", "Emily");
        let bronte = session.resolve_or_create_author(&mut accented).unwrap();
        let mut plain = Author::new("BRONTE", "emily");
        assert_eq!(session.resolve_or_create_author(&mut plain).unwrap(), bronte);
        assert_eq!(session.authors().unwrap().len(), 2);
    }

    #[test]
    fn test_stale_id_creates_new_row() {
        let db = db();
        let session = db.session();
        let mut author = Author::new("Nobody", "");
        author.id = 12345;
        assert_eq!(session.resolve_author(&mut author).unwrap(), None);
        assert_eq!(author.id, 12345);
        let id = session.resolve_or_create_author(&mut author).unwrap();
        assert_ne!(id, 12345);
        assert_eq!(author.id, id);
    }

    #[test]
    fn test_empty_name_rejected() {
        let db = db();
        let session = db.session();
        let err = session
            .resolve_or_create_series(&mut Series::new("  ", "1"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_series_resolution_keeps_number() {
        let db = db();
        let session = db.session();
        session
            .resolve_or_create_series(&mut Series::new("Discworld", ""))
            .unwrap();
        let mut probe = Series::new("DISCWORLD", "7");
        assert!(session.resolve_series(&mut probe).unwrap().is_some());
        assert_eq!(probe.name, "Discworld");
        assert_eq!(probe.number, "7");
    }

    #[test]
    fn test_author_merge_redirects_and_deletes() {
        let db = db();
        let session = db.session();
        let mut first = Book::new("One")
            .with_author(Author::new("Smith", "J"))
            .with_author(Author::new("Smith", "John"));
        session.insert_book(&mut first).unwrap();
        let mut second = Book::new("Two").with_author(Author::new("Smith", "J"));
        session.insert_book(&mut second).unwrap();

        session
            .global_replace_author(&Author::new("Smith", "J"), &mut Author::new("Smith", "John"))
            .unwrap();

        let authors = session.book_authors(first.id).unwrap();
        assert_eq!(authors.len(), 1);
        assert_eq!(authors[0].given_names, "John");
        let authors = session.book_authors(second.id).unwrap();
        assert_eq!(authors[0].given_names, "John");
        let mut gone = Author::new("Smith", "J");
        assert_eq!(session.resolve_author(&mut gone).unwrap(), None);
    }

    #[test]
    fn test_author_merge_covers_toc() {
        let db = db();
        let session = db.session();
        let mut book = Book::new("Collected")
            .with_author(Author::new("Editor", "An"))
            .with_toc_entry(TocEntry::new(Author::new("Old", "Name"), "Story"))
            .with_toc_entry(TocEntry::new(Author::new("New", "Name"), "Story"))
            .with_toc_entry(TocEntry::new(Author::new("Old", "Name"), "Other"));
        session.insert_book(&mut book).unwrap();

        session
            .global_replace_author(&Author::new("Old", "Name"), &mut Author::new("New", "Name"))
            .unwrap();

        let toc = session.book_toc(book.id).unwrap();
        assert_eq!(toc.len(), 2);
        assert!(toc.iter().all(|e| e.author.family_name == "New"));
        assert_eq!(toc[0].title, "Story");
        assert_eq!(toc[1].title, "Other");
    }

    #[test]
    fn test_merge_of_same_author_renames() {
        let db = db();
        let session = db.session();
        let mut book = Book::new("X").with_author(Author::new("mcdonald", "ross"));
        session.insert_book(&mut book).unwrap();

        session
            .global_replace_author(&Author::new("mcdonald", "ross"), &mut Author::new("McDonald", "Ross"))
            .unwrap();
        let authors = session.book_authors(book.id).unwrap();
        assert_eq!(authors[0].family_name, "McDonald");
        assert_eq!(session.authors().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_merge_source_rejected() {
        let db = db();
        let session = db.session();
        let err = session
            .global_replace_series(&Series::new("Nope", ""), &mut Series::new("Other", ""))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(session.all_series().unwrap().is_empty());
    }

    #[test]
    fn test_bookshelf_merge() {
        let db = db();
        let session = db.session();
        let mut book = Book::new("Shelved")
            .with_bookshelf(Bookshelf::new("Attic"))
            .with_bookshelf(Bookshelf::new("Study"));
        session.insert_book(&mut book).unwrap();

        session
            .global_replace_bookshelf(&Bookshelf::new("Attic"), &mut Bookshelf::new("Study"))
            .unwrap();
        let shelves = session.book_bookshelves(book.id).unwrap();
        assert_eq!(shelves.len(), 1);
        assert_eq!(shelves[0].name, "Study");
        assert!(session.bookshelves().unwrap().iter().all(|s| s.name != "Attic"));
    }

    #[test]
    fn test_rename_author_in_place() {
        let db = db();
        let session = db.session();
        let mut book = Book::new("Solaris").with_author(Author::new("Lem", "S."));
        session.insert_book(&mut book).unwrap();

        let mut author = session.book_authors(book.id).unwrap().remove(0);
        let id = author.id;
        author.given_names = "Stanisław ".to_string();
        assert!(session.update_author(&mut author).unwrap());
        assert_eq!(author.id, id);
        assert_eq!(author.given_names, "Stanisław");
        assert_eq!(session.get_author(id).unwrap().unwrap().given_names, "Stanisław");
        assert_eq!(session.search_books(Some("Stanisław"), None, None).unwrap(), vec![book.id]);
    }

    #[test]
    fn test_rename_author_onto_existing_name_merges() {
        let db = db();
        let session = db.session();
        let mut first = Book::new("One").with_author(Author::new("Le Guin", "U. K."));
        session.insert_book(&mut first).unwrap();
        let mut second = Book::new("Two")
            .with_author(Author::new("Le Guin", "Ursula K."))
            .with_toc_entry(TocEntry::new(Author::new("Le Guin", "U. K."), "Story"));
        session.insert_book(&mut second).unwrap();
        let survivor = session.book_authors(second.id).unwrap()[0].id;

        let mut renamed = session.book_authors(first.id).unwrap().remove(0);
        renamed.given_names = "URSULA K.".to_string();
        assert!(session.update_author(&mut renamed).unwrap());

        assert_eq!(renamed.id, survivor);
        let authors = session.authors().unwrap();
        assert_eq!(authors.len(), 1);
        assert_eq!(authors[0].given_names, "URSULA K.");
        assert_eq!(session.book_authors(first.id).unwrap()[0].id, survivor);
        assert_eq!(session.book_toc(second.id).unwrap()[0].author.id, survivor);
    }

    #[test]
    fn test_update_unknown_author_is_false() {
        let db = db();
        let session = db.session();
        let mut ghost = Author::new("Ghost", "");
        ghost.id = 404;
        assert!(!session.update_author(&mut ghost).unwrap());
        assert_eq!(ghost.id, 404);
        assert!(session.authors().unwrap().is_empty());
    }

    #[test]
    fn test_rename_series_onto_existing_name_merges() {
        let db = db();
        let session = db.session();
        let mut first = Book::new("Guards! Guards!").with_series(Series::new("Disc World", "8"));
        session.insert_book(&mut first).unwrap();
        let mut second = Book::new("Mort").with_series(Series::new("Discworld", "4"));
        session.insert_book(&mut second).unwrap();

        let mut series = session.book_series(first.id).unwrap().remove(0);
        let old_id = series.id;
        series.name = "discworld".to_string();
        assert!(session.update_series(&mut series).unwrap());

        assert_ne!(series.id, old_id);
        let all = session.all_series().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "discworld");
        let kept = session.book_series(first.id).unwrap();
        assert_eq!(kept[0].id, series.id);
        assert_eq!(kept[0].number, "8");
    }

    #[test]
    fn test_resolution_trims_names() {
        let db = db();
        let session = db.session();
        let mut padded = Author::new("  Asimov ", " Isaac  ");
        let id = session.resolve_or_create_author(&mut padded).unwrap();
        assert_eq!(padded.family_name, "Asimov");
        assert_eq!(padded.given_names, "Isaac");
        let stored = session.get_author(id).unwrap().unwrap();
        assert_eq!((stored.family_name.as_str(), stored.given_names.as_str()), ("Asimov", "Isaac"));

        let mut plain = Author::new("Asimov", "Isaac");
        assert_eq!(session.resolve_or_create_author(&mut plain).unwrap(), id);
        let shelf = session.resolve_or_create_bookshelf(&mut Bookshelf::new(" Attic ")).unwrap();
        assert_eq!(session.resolve_or_create_bookshelf(&mut Bookshelf::new("Attic")).unwrap(), shelf);
    }

    #[test]
    fn test_purge_removes_orphans() {
        let db = db();
        let session = db.session();
        let mut book = Book::new("Kept")
            .with_author(Author::new("Kept", ""))
            .with_series(Series::new("Kept", "1"));
        session.insert_book(&mut book).unwrap();
        session.resolve_or_create_author(&mut Author::new("Orphan", "")).unwrap();
        session.resolve_or_create_series(&mut Series::new("Orphan", "")).unwrap();

        let counts = session.purge().unwrap();
        assert_eq!(counts, PurgeCounts { authors: 1, series: 1 });
        assert_eq!(session.authors().unwrap().len(), 1);
        assert_eq!(session.purge().unwrap(), PurgeCounts::default());
    }
}
