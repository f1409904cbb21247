//! Book and loan operations.

use super::association::{replace_authors, replace_bookshelves, replace_series, replace_toc};
use super::resolver::{load_book_authors, load_book_bookshelves, load_book_series, load_book_toc};
use super::search;
use super::session::Session;
use super::statements::StatementCache;
use crate::models::{Book, UNSAVED_ID};
use crate::{Error, Result, current_timestamp};
use rusqlite::types::Value;
use rusqlite::{Connection, Row, ToSql, params};
use tracing::instrument;
use uuid::Uuid;

const BOOK_SELECT: &str = "SELECT _id, book_uuid, title, isbn, publisher, date_published, rating,
        read, pages, notes, list_price, anthology, location, read_start, read_end, format,
        signed, description, genre, language, date_added, goodreads_book_id,
        last_goodreads_sync_date, last_update_date
    FROM books";

/// Reads a column as text whatever its storage class. NULL is empty.
fn text(row: &Row<'_>, idx: usize) -> rusqlite::Result<String> {
    Ok(match row.get::<_, Value>(idx)? {
        Value::Null | Value::Blob(_) => String::new(),
        Value::Text(s) => s,
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
    })
}

/// Reads a boolean stored as 0/1 or, in old rows, as 't'/'f'.
fn flag(row: &Row<'_>, idx: usize) -> rusqlite::Result<bool> {
    Ok(match row.get::<_, Value>(idx)? {
        Value::Integer(i) => i != 0,
        Value::Real(r) => r != 0.0,
        Value::Text(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "t" | "true" | "1" | "y" | "yes"),
        Value::Null | Value::Blob(_) => false,
    })
}

#[allow(clippy::cast_possible_truncation)]
fn integer(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<i64>> {
    Ok(match row.get::<_, Value>(idx)? {
        Value::Integer(i) => Some(i),
        Value::Real(r) => Some(r as i64),
        Value::Text(s) => s.trim().parse().ok(),
        Value::Null | Value::Blob(_) => None,
    })
}

#[allow(clippy::cast_precision_loss)]
fn real(row: &Row<'_>, idx: usize) -> rusqlite::Result<f64> {
    Ok(match row.get::<_, Value>(idx)? {
        Value::Integer(i) => i as f64,
        Value::Real(r) => r,
        Value::Text(s) => s.trim().parse().unwrap_or_default(),
        Value::Null | Value::Blob(_) => 0.0,
    })
}

fn optional_text(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    let value = text(row, idx)?;
    Ok((!value.is_empty()).then_some(value))
}

fn book_from_row(row: &Row<'_>) -> rusqlite::Result<Book> {
    Ok(Book {
        id: row.get(0)?,
        uuid: text(row, 1)?,
        title: text(row, 2)?,
        isbn: text(row, 3)?,
        publisher: text(row, 4)?,
        date_published: text(row, 5)?,
        rating: real(row, 6)?,
        read: flag(row, 7)?,
        pages: integer(row, 8)?,
        notes: text(row, 9)?,
        list_price: text(row, 10)?,
        anthology_mask: integer(row, 11)?.unwrap_or_default(),
        location: text(row, 12)?,
        read_start: text(row, 13)?,
        read_end: text(row, 14)?,
        format: text(row, 15)?,
        signed: flag(row, 16)?,
        description: text(row, 17)?,
        genre: text(row, 18)?,
        language: text(row, 19)?,
        date_added: optional_text(row, 20)?,
        goodreads_book_id: integer(row, 21)?.unwrap_or_default(),
        last_goodreads_sync_date: text(row, 22)?,
        last_update_date: optional_text(row, 23)?,
        ..Book::default()
    })
}

fn validate(book: &Book) -> Result<()> {
    if book.title.trim().is_empty() {
        return Err(Error::InvalidInput("book title must not be empty".to_string()));
    }
    Ok(())
}

/// Rewrites every association list of `book` and refreshes its index row.
fn write_associations(conn: &Connection, stmts: &mut StatementCache, book: &mut Book) -> Result<()> {
    replace_authors(conn, stmts, book.id, &mut book.authors)?;
    replace_series(conn, stmts, book.id, &mut book.series)?;
    replace_toc(conn, stmts, book.id, &mut book.toc)?;
    replace_bookshelves(conn, stmts, book.id, &mut book.bookshelves)?;
    search::refresh_book(conn, stmts, book.id);
    Ok(())
}

fn load_book(
    conn: &Connection,
    stmts: &mut StatementCache,
    name: &'static str,
    key_column: &str,
    key: &dyn ToSql,
) -> Result<Option<Book>> {
    let Some(mut book) = stmts
        .get_or_add(conn, name, &format!("{BOOK_SELECT} WHERE {key_column} = ?1"))?
        .query_row(conn, &[key], book_from_row)?
    else {
        return Ok(None);
    };
    book.authors = load_book_authors(conn, stmts, book.id)?;
    book.series = load_book_series(conn, stmts, book.id)?;
    book.toc = load_book_toc(conn, stmts, book.id)?;
    book.bookshelves = load_book_bookshelves(conn, stmts, book.id)?;
    Ok(Some(book))
}

/// Stamps `last_update_date` on each book and refreshes its index row.
pub(crate) fn mark_books_dirty(conn: &Connection, stmts: &mut StatementCache, books: &[i64]) -> Result<()> {
    if books.is_empty() {
        return Ok(());
    }
    let now = current_timestamp();
    let touch = stmts.get_or_add(
        conn,
        "touch_book",
        "UPDATE books SET last_update_date = ?1 WHERE _id = ?2",
    )?;
    for &book in books {
        touch.execute(conn, params![now, book])?;
        search::refresh_book(conn, stmts, book);
    }
    Ok(())
}

impl Session<'_> {
    /// Inserts `book` with all its associations and indexes it.
    ///
    /// Assigns the row id, a fresh uuid when none is set, `date_added` when
    /// absent and `last_update_date`. Association entities get their
    /// resolved ids. `book` is only changed once the insert has committed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty title or entity name,
    /// [`Error::ConstraintViolation`] for a duplicate uuid.
    #[instrument(skip(self, book), fields(operation = "insert_book", backend = "sqlite", title = %book.title))]
    pub fn insert_book(&self, book: &mut Book) -> Result<i64> {
        validate(book)?;
        let staged = self.write("insert_book", |conn, stmts| {
            let mut staged = book.clone();
            let now = current_timestamp();
            if staged.uuid.trim().is_empty() {
                staged.uuid = Uuid::new_v4().simple().to_string();
            }
            let date_added = staged.date_added.clone().unwrap_or_else(|| now.clone());

            let id = stmts
                .get_or_add(
                    conn,
                    "insert_book",
                    "INSERT INTO books (title, isbn, publisher, date_published, rating, read, pages,
                        notes, list_price, anthology, location, read_start, read_end, format,
                        signed, description, genre, language, date_added, goodreads_book_id,
                        last_goodreads_sync_date, book_uuid, last_update_date)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                        ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
                )?
                .insert(
                    conn,
                    params![
                        staged.title.trim(),
                        staged.isbn,
                        staged.publisher,
                        staged.date_published,
                        staged.rating,
                        staged.read,
                        staged.pages,
                        staged.notes,
                        staged.list_price,
                        staged.anthology_mask,
                        staged.location,
                        staged.read_start,
                        staged.read_end,
                        staged.format,
                        staged.signed,
                        staged.description,
                        staged.genre,
                        staged.language,
                        date_added,
                        staged.goodreads_book_id,
                        staged.last_goodreads_sync_date,
                        staged.uuid,
                        now,
                    ],
                )?;

            staged.id = id;
            staged.date_added = Some(date_added);
            staged.last_update_date = Some(now);
            write_associations(conn, stmts, &mut staged)?;
            tracing::debug!(id, uuid = %staged.uuid, "book inserted");
            Ok(staged)
        })?;
        // Only a committed insert is reflected on the caller's book.
        *book = staged;
        Ok(book.id)
    }

    /// Updates the stored row of `book.id`, replacing its associations.
    ///
    /// The stored uuid is never changed. Returns false when no book has
    /// `book.id`.
    ///
    /// # Errors
    ///
    /// As for [`insert_book`](Self::insert_book).
    #[instrument(skip(self, book), fields(operation = "update_book", backend = "sqlite", id = book.id))]
    pub fn update_book(&self, book: &mut Book) -> Result<bool> {
        validate(book)?;
        if book.id == UNSAVED_ID {
            return Ok(false);
        }
        let staged = self.write("update_book", |conn, stmts| {
            let mut staged = book.clone();
            let now = current_timestamp();
            let changed = stmts
                .get_or_add(
                    conn,
                    "update_book",
                    "UPDATE books SET title = ?1, isbn = ?2, publisher = ?3, date_published = ?4,
                        rating = ?5, read = ?6, pages = ?7, notes = ?8, list_price = ?9,
                        anthology = ?10, location = ?11, read_start = ?12, read_end = ?13,
                        format = ?14, signed = ?15, description = ?16, genre = ?17,
                        language = ?18, date_added = coalesce(?19, date_added),
                        goodreads_book_id = ?20, last_goodreads_sync_date = ?21,
                        last_update_date = ?22
                     WHERE _id = ?23",
                )?
                .execute(
                    conn,
                    params![
                        staged.title.trim(),
                        staged.isbn,
                        staged.publisher,
                        staged.date_published,
                        staged.rating,
                        staged.read,
                        staged.pages,
                        staged.notes,
                        staged.list_price,
                        staged.anthology_mask,
                        staged.location,
                        staged.read_start,
                        staged.read_end,
                        staged.format,
                        staged.signed,
                        staged.description,
                        staged.genre,
                        staged.language,
                        staged.date_added,
                        staged.goodreads_book_id,
                        staged.last_goodreads_sync_date,
                        now,
                        staged.id,
                    ],
                )?;
            if changed == 0 {
                return Ok(None);
            }

            if let Some((uuid, date_added)) = stmts
                .get_or_add(
                    conn,
                    "book_stamps",
                    "SELECT book_uuid, date_added FROM books WHERE _id = ?1",
                )?
                .query_row(conn, params![staged.id], |row| Ok((text(row, 0)?, optional_text(row, 1)?)))?
            {
                staged.uuid = uuid;
                staged.date_added = date_added;
            }
            staged.last_update_date = Some(now);
            write_associations(conn, stmts, &mut staged)?;
            Ok(Some(staged))
        })?;
        let Some(staged) = staged else {
            return Ok(false);
        };
        *book = staged;
        Ok(true)
    }

    /// Deletes a book, its links, loan and table of contents, and its index
    /// row. Returns false when nothing was deleted.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    #[instrument(skip(self), fields(operation = "delete_book", backend = "sqlite"))]
    pub fn delete_book(&self, id: i64) -> Result<bool> {
        self.write("delete_book", |conn, stmts| {
            for (name, sql) in [
                ("delete_book_authors", "DELETE FROM book_author WHERE book = ?1"),
                ("delete_book_series", "DELETE FROM book_series WHERE book = ?1"),
                ("delete_book_bookshelves", "DELETE FROM book_bookshelf_weak WHERE book = ?1"),
                ("delete_book_toc", "DELETE FROM anthology WHERE book = ?1"),
                ("delete_book_loan", "DELETE FROM loan WHERE book = ?1"),
            ] {
                stmts.get_or_add(conn, name, sql)?.execute(conn, params![id])?;
            }
            let deleted = stmts
                .get_or_add(conn, "delete_book", "DELETE FROM books WHERE _id = ?1")?
                .execute(conn, params![id])?;
            search::remove_book(conn, stmts, id);
            Ok(deleted > 0)
        })
    }

    /// Fetches a book with its associations.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    #[instrument(skip(self), fields(operation = "get_book", backend = "sqlite"))]
    pub fn get_book(&self, id: i64) -> Result<Option<Book>> {
        self.read("get_book", |conn, stmts| load_book(conn, stmts, "get_book", "_id", &id))
    }

    /// Fetches a book by its stable uuid.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    #[instrument(skip(self), fields(operation = "get_book_by_uuid", backend = "sqlite"))]
    pub fn get_book_by_uuid(&self, uuid: &str) -> Result<Option<Book>> {
        self.read("get_book_by_uuid", |conn, stmts| {
            load_book(conn, stmts, "get_book_by_uuid", "book_uuid", &uuid)
        })
    }

    /// Number of books in the store.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    pub fn book_count(&self) -> Result<i64> {
        self.read("book_count", |conn, stmts| {
            stmts
                .get_or_add(conn, "book_count", "SELECT count(*) FROM books")?
                .query_row(conn, params![], |row| row.get(0))
                .map(Option::unwrap_or_default)
        })
    }

    /// Who `book` is lent to, if anyone.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    pub fn get_loanee(&self, book: i64) -> Result<Option<String>> {
        self.read("get_loanee", |conn, stmts| {
            stmts
                .get_or_add(conn, "get_loanee", "SELECT loaned_to FROM loan WHERE book = ?1")?
                .query_row(conn, params![book], |row| row.get(0))
        })
    }

    /// Lends `book` to `loanee`, replacing any current loan.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty loanee.
    #[instrument(skip(self, loanee), fields(operation = "lend_book", backend = "sqlite"))]
    pub fn lend_book(&self, book: i64, loanee: &str) -> Result<()> {
        let loanee = loanee.trim();
        if loanee.is_empty() {
            return Err(Error::InvalidInput("loanee must not be empty".to_string()));
        }
        self.write("lend_book", |conn, stmts| {
            let exists = stmts
                .get_or_add(conn, "book_exists", "SELECT 1 FROM books WHERE _id = ?1")?
                .query_row(conn, params![book], |_| Ok(()))?
                .is_some();
            if !exists {
                return Err(Error::InvalidInput(format!("no book with id {book}")));
            }
            stmts
                .get_or_add(conn, "delete_book_loan", "DELETE FROM loan WHERE book = ?1")?
                .execute(conn, params![book])?;
            stmts
                .get_or_add(conn, "insert_loan", "INSERT INTO loan (book, loaned_to) VALUES (?1, ?2)")?
                .execute(conn, params![book, loanee])?;
            Ok(())
        })
    }

    /// Ends the loan of `book`. Returns false when it was not lent.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    #[instrument(skip(self), fields(operation = "return_book", backend = "sqlite"))]
    pub fn return_book(&self, book: i64) -> Result<bool> {
        self.write("return_book", |conn, stmts| {
            let removed = stmts
                .get_or_add(conn, "delete_book_loan", "DELETE FROM loan WHERE book = ?1")?
                .execute(conn, params![book])?;
            Ok(removed > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CatalogueDb;
    use crate::{Author, Bookshelf, Series, StoreConfig, TocEntry};

    fn db() -> CatalogueDb {
        CatalogueDb::in_memory(StoreConfig::default()).unwrap()
    }

    fn sample() -> Book {
        Book::new("The Left Hand of Darkness")
            .with_author(Author::new("Le Guin", "Ursula K."))
            .with_series(Series::new("Hainish Cycle", "4"))
            .with_toc_entry(TocEntry::new(Author::new("Le Guin", "Ursula K."), "Winter's King"))
            .with_bookshelf(Bookshelf::new(Bookshelf::DEFAULT_NAME))
    }

    #[test]
    fn test_insert_and_get_round_trip() {
        let db = db();
        let session = db.session();
        let mut book = sample();
        book.pages = Some(304);
        book.read = true;
        let id = session.insert_book(&mut book).unwrap();

        assert_eq!(book.uuid.len(), 32);
        assert!(book.uuid.chars().all(|c| c.is_ascii_hexdigit()));
        let stored = session.get_book(id).unwrap().unwrap();
        assert_eq!(stored.title, book.title);
        assert_eq!(stored.pages, Some(304));
        assert!(stored.read);
        assert_eq!(stored.authors, book.authors);
        assert_eq!(stored.series[0].number, "4");
        assert_eq!(stored.toc[0].title, "Winter's King");
        assert_eq!(stored.bookshelves[0].name, "Default");
        assert_eq!(stored.uuid, book.uuid);
        assert!(stored.date_added.is_some());

        let by_uuid = session.get_book_by_uuid(&book.uuid).unwrap().unwrap();
        assert_eq!(by_uuid.id, id);
    }

    #[test]
    fn test_missing_book_is_none() {
        let db = db();
        let session = db.session();
        assert!(session.get_book(404).unwrap().is_none());
        assert!(session.get_book_by_uuid("nope").unwrap().is_none());
        assert!(!session.delete_book(404).unwrap());
    }

    #[test]
    fn test_update_keeps_uuid_and_replaces_lists() {
        let db = db();
        let session = db.session();
        let mut book = sample();
        session.insert_book(&mut book).unwrap();
        let uuid = book.uuid.clone();

        book.uuid = String::new();
        book.authors = vec![Author::new("Other", "Author")];
        book.toc.clear();
        assert!(session.update_book(&mut book).unwrap());
        assert_eq!(book.uuid, uuid);

        let stored = session.get_book(book.id).unwrap().unwrap();
        assert_eq!(stored.authors.len(), 1);
        assert_eq!(stored.authors[0].family_name, "Other");
        assert!(stored.toc.is_empty());
        assert_eq!(stored.uuid, uuid);
    }

    #[test]
    fn test_update_unknown_book() {
        let db = db();
        let session = db.session();
        let mut book = Book::new("Ghost");
        assert!(!session.update_book(&mut book).unwrap());
        book.id = 999;
        assert!(!session.update_book(&mut book).unwrap());
    }

    #[test]
    fn test_isbn_change_resets_goodreads() {
        let db = db();
        let session = db.session();
        let mut book = Book::new("Dune");
        book.isbn = "111".to_string();
        book.goodreads_book_id = 77;
        session.insert_book(&mut book).unwrap();

        book.isbn = "222".to_string();
        session.update_book(&mut book).unwrap();
        let stored = session.get_book(book.id).unwrap().unwrap();
        assert_eq!(stored.goodreads_book_id, 0);
    }

    #[test]
    fn test_empty_title_rejected() {
        let db = db();
        let session = db.session();
        let err = session.insert_book(&mut Book::new(" ")).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(session.book_count().unwrap(), 0);
    }

    #[test]
    fn test_failed_association_rolls_back_book() {
        let db = db();
        let session = db.session();
        let mut book = Book::new("Half").with_author(Author::new("", "Nameless"));
        assert!(session.insert_book(&mut book).is_err());
        assert_eq!(session.book_count().unwrap(), 0);
        assert_eq!(book.id, UNSAVED_ID);
        assert!(book.uuid.is_empty());
        assert!(book.date_added.is_none());
        assert!(book.last_update_date.is_none());
    }

    #[test]
    fn test_failed_update_leaves_caller_book_alone() {
        let db = db();
        let session = db.session();
        let mut book = Book::new("Whole").with_author(Author::new("Known", ""));
        session.insert_book(&mut book).unwrap();
        let stamped = book.last_update_date.clone();

        let mut edited = book.clone();
        edited.title = "Edited".to_string();
        edited.authors.push(Author::new(" ", "Nameless"));
        assert!(session.update_book(&mut edited).is_err());
        assert_eq!(edited.last_update_date, stamped);
        assert_eq!(edited.authors[0].id, book.authors[0].id);
        assert_eq!(edited.authors[1].id, UNSAVED_ID);
        assert_eq!(session.get_book(book.id).unwrap().unwrap().title, "Whole");
    }

    #[test]
    fn test_lending_unknown_book_rejected() {
        let db = db();
        let session = db.session();
        let err = session.lend_book(42, "Alice").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_loans() {
        let db = db();
        let session = db.session();
        let mut book = Book::new("Borrowed");
        let id = session.insert_book(&mut book).unwrap();

        assert_eq!(session.get_loanee(id).unwrap(), None);
        session.lend_book(id, "Alice").unwrap();
        session.lend_book(id, "Bob").unwrap();
        assert_eq!(session.get_loanee(id).unwrap().as_deref(), Some("Bob"));
        assert!(session.return_book(id).unwrap());
        assert!(!session.return_book(id).unwrap());
        assert!(session.lend_book(id, "  ").is_err());
    }

    #[test]
    fn test_delete_removes_links() {
        let db = db();
        let session = db.session();
        let mut book = sample();
        let id = session.insert_book(&mut book).unwrap();
        session.lend_book(id, "Carol").unwrap();

        assert!(session.delete_book(id).unwrap());
        assert!(session.book_authors(id).unwrap().is_empty());
        assert!(session.book_toc(id).unwrap().is_empty());
        assert_eq!(session.get_loanee(id).unwrap(), None);
        assert_eq!(session.book_count().unwrap(), 0);
    }

    #[test]
    fn test_multi_step_transaction() {
        let db = db();
        let session = db.session();
        let tx = session.begin_write().unwrap();
        session.insert_book(&mut Book::new("One")).unwrap();
        session.insert_book(&mut Book::new("Two")).unwrap();
        tx.rollback().unwrap();
        assert_eq!(session.book_count().unwrap(), 0);

        let tx = session.begin_write().unwrap();
        session.insert_book(&mut Book::new("Three")).unwrap();
        tx.commit().unwrap();
        assert_eq!(session.book_count().unwrap(), 1);
    }
}
