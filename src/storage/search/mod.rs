//! Full-text shadow index over books.
//!
//! One `books_fts` row per book, keyed by rowid = book id. Row writes refresh
//! the index inside the same transaction. Index failures never fail the row
//! write: they are logged, counted and left for the next [`rebuild_all`].

mod query;
mod text;

pub use query::{FtsQuery, clean_fragment};

use super::schema::fts_ddl;
use super::session::Session;
use super::sqlite::db_error;
use super::statements::StatementCache;
use crate::Result;
use rusqlite::{Connection, params};
use std::num::NonZeroUsize;
use std::time::Instant;
use text::load_document;
use tracing::instrument;

/// Live index table.
pub const INDEX_TABLE: &str = "books_fts";

/// Side table a rebuild fills before it is swapped in.
const TEMP_TABLE: &str = "books_fts_temp";

fn record_failure(book: i64, stage: &'static str, error: &crate::Error) {
    metrics::counter!("search_index_failures_total", "stage" => stage).increment(1);
    tracing::warn!(book, stage, error = %error, "search index update failed; a rebuild will repair it");
}

fn write_row(conn: &Connection, stmts: &mut StatementCache, book: i64) -> Result<()> {
    stmts
        .get_or_add(conn, "fts_delete", "DELETE FROM books_fts WHERE rowid = ?1")?
        .execute(conn, params![book])?;
    if let Some(doc) = load_document(conn, stmts, book)? {
        stmts
            .get_or_add(
                conn,
                "fts_insert",
                "INSERT INTO books_fts (rowid, author_name, title, description, notes,
                                        publisher, genre, location, isbn)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?
            .execute(conn, &doc.insert_params(&book))?;
    }
    Ok(())
}

/// Rewrites the index row of `book` from its current row-store state.
///
/// Runs inside a savepoint so a failure undoes only the index change.
/// Never fails the caller.
pub(crate) fn refresh_book(conn: &Connection, stmts: &mut StatementCache, book: i64) {
    if let Err(e) = conn
        .execute_batch("SAVEPOINT search_index")
        .map_err(|e| db_error("fts_savepoint", e))
    {
        record_failure(book, "savepoint", &e);
        return;
    }
    match write_row(conn, stmts, book) {
        Ok(()) => {
            if let Err(e) = conn.execute_batch("RELEASE search_index") {
                record_failure(book, "release", &db_error("fts_release", e));
            }
        },
        Err(e) => {
            record_failure(book, "upsert", &e);
            if let Err(e) = conn.execute_batch("ROLLBACK TO search_index; RELEASE search_index") {
                tracing::warn!(error = %e, "could not unwind search index savepoint");
            }
        },
    }
}

/// Removes the index row of `book`. Never fails the caller.
pub(crate) fn remove_book(conn: &Connection, stmts: &mut StatementCache, book: i64) {
    let result = stmts
        .get_or_add(conn, "fts_delete", "DELETE FROM books_fts WHERE rowid = ?1")
        .and_then(|stmt| stmt.execute(conn, params![book]));
    if let Err(e) = result {
        record_failure(book, "delete", &e);
    }
}

/// Rebuilds the whole index off to the side, then swaps it in.
///
/// The side table is filled in one transaction. The drop-and-rename runs
/// afterwards with no transaction open. Returns the number of indexed books.
///
/// # Errors
///
/// Returns [`crate::Error::Usage`] if a transaction is open on `conn`, or the
/// mapped engine error. The live index is untouched on failure.
pub(crate) fn rebuild_all(conn: &Connection, capacity: NonZeroUsize) -> Result<usize> {
    if !conn.is_autocommit() {
        return Err(crate::Error::Usage(
            "the search index cannot be rebuilt inside a transaction".to_string(),
        ));
    }
    let start = Instant::now();
    let mut stmts = StatementCache::new(capacity);

    let indexed = super::database::run_in_transaction(conn, "rebuild_search_index", |conn| {
        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {TEMP_TABLE}; {};",
            fts_ddl(TEMP_TABLE)
        ))
        .map_err(|e| db_error("create_search_temp", e))?;

        let books: Vec<i64> = stmts
            .get_or_add(conn, "all_book_ids", "SELECT _id FROM books ORDER BY _id")?
            .query_map(conn, params![], |row| row.get(0))?;

        for &book in &books {
            if let Some(doc) = load_document(conn, &mut stmts, book)? {
                stmts
                    .get_or_add(
                        conn,
                        "fts_temp_insert",
                        "INSERT INTO books_fts_temp (rowid, author_name, title, description,
                                                     notes, publisher, genre, location, isbn)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    )?
                    .execute(conn, &doc.insert_params(&book))?;
            }
        }
        Ok(books.len())
    })?;

    // Compiled statements may still reference the old table.
    stmts.clear(conn);
    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {INDEX_TABLE}; ALTER TABLE {TEMP_TABLE} RENAME TO {INDEX_TABLE};"
    ))
    .map_err(|e| db_error("swap_search_index", e))?;

    tracing::info!(
        books = indexed,
        elapsed_ms = start.elapsed().as_millis(),
        "search index rebuilt"
    );
    Ok(indexed)
}

impl Session<'_> {
    /// Searches the index with up to three fragments: author-scoped,
    /// title-scoped and anywhere.
    ///
    /// Returns matching book ids. Input that cleans down to nothing is "no
    /// query" and yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    #[instrument(skip(self), fields(operation = "search_books", backend = "sqlite"))]
    pub fn search_books(
        &self,
        author: Option<&str>,
        title: Option<&str>,
        keywords: Option<&str>,
    ) -> Result<Vec<i64>> {
        let Some(query) = FtsQuery::build(author, title, keywords) else {
            tracing::debug!("search input cleaned to nothing");
            return Ok(Vec::new());
        };
        let rendered = query.to_string();
        self.read("search_books", |conn, stmts| {
            stmts
                .get_or_add(
                    conn,
                    "search_books",
                    "SELECT rowid FROM books_fts WHERE books_fts MATCH ?1 ORDER BY rowid",
                )?
                .query_map(conn, params![rendered], |row| row.get(0))
        })
    }

    /// Rebuilds the search index from the row store.
    ///
    /// Takes the exclusive lock and refuses to run while the calling thread
    /// has a transaction open.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Usage`] inside a transaction,
    /// [`crate::Error::Cancelled`] if the lock wait is cancelled, or the
    /// mapped engine error.
    #[instrument(skip(self), fields(operation = "rebuild_search_index", backend = "sqlite"))]
    pub fn rebuild_search_index(&self) -> Result<usize> {
        let capacity = NonZeroUsize::new(self.db.config().statement_cache_capacity)
            .unwrap_or(NonZeroUsize::MIN);
        self.exclusive("rebuild_search_index", |conn| {
            let indexed = rebuild_all(conn, capacity)?;
            // Every session's compiled statements referenced the dropped table.
            conn.flush_prepared_statement_cache();
            Ok(indexed)
        })
    }
}
