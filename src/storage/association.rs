//! Ordered many-to-many links between a book and its authors, series, table
//! of contents and bookshelves.
//!
//! Lists are always replaced wholesale: every row for the book is deleted and
//! the list is reinserted with positions `1..=n`. Swapping two positions in
//! place would trip the `(book, position)` key half way through.

use super::resolver::resolve_or_create;
use super::sqlite::{collation_key, db_error};
use super::statements::StatementCache;
use crate::models::{Author, Bookshelf, Series, TocEntry};
use crate::{Error, Result};
use rusqlite::{Connection, params};
use std::collections::HashSet;

/// Position columns are 1-based.
const FIRST_POSITION: i64 = 1;

fn require_write_transaction(conn: &Connection, operation: &str) -> Result<()> {
    if conn.is_autocommit() {
        return Err(Error::Usage(format!(
            "'{operation}' requires an open write transaction"
        )));
    }
    Ok(())
}

/// Replaces the ordered author list of `book`.
///
/// Authors are resolved (created if needed) and their ids written back.
/// Duplicates by resolved id keep their first position.
pub(crate) fn replace_authors(
    conn: &Connection,
    stmts: &mut StatementCache,
    book: i64,
    authors: &mut [Author],
) -> Result<()> {
    require_write_transaction(conn, "replace_authors")?;
    stmts
        .get_or_add(conn, "delete_book_authors", "DELETE FROM book_author WHERE book = ?1")?
        .execute(conn, params![book])?;

    let mut seen = HashSet::new();
    let mut position = FIRST_POSITION;
    for author in authors.iter_mut() {
        let id = resolve_or_create(conn, stmts, author, false)?;
        if !seen.insert(id) {
            continue;
        }
        stmts
            .get_or_add(
                conn,
                "insert_book_author",
                "INSERT INTO book_author (book, author, author_position) VALUES (?1, ?2, ?3)",
            )?
            .execute(conn, params![book, id, position])?;
        position += 1;
    }
    Ok(())
}

/// Replaces the ordered series list of `book`. The per-link number travels
/// with each entry.
pub(crate) fn replace_series(
    conn: &Connection,
    stmts: &mut StatementCache,
    book: i64,
    series: &mut [Series],
) -> Result<()> {
    require_write_transaction(conn, "replace_series")?;
    stmts
        .get_or_add(conn, "delete_book_series", "DELETE FROM book_series WHERE book = ?1")?
        .execute(conn, params![book])?;

    let mut seen = HashSet::new();
    let mut position = FIRST_POSITION;
    for entry in series.iter_mut() {
        let id = resolve_or_create(conn, stmts, entry, false)?;
        if !seen.insert(id) {
            continue;
        }
        stmts
            .get_or_add(
                conn,
                "insert_book_series",
                "INSERT INTO book_series (book, series_id, series_num, series_position)
                 VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(conn, params![book, id, entry.number.trim(), position])?;
        position += 1;
    }
    Ok(())
}

/// Replaces the table of contents of `book`.
///
/// Entries are unique per book on (author, title); titles compare under the
/// `LOCALIZED` rules.
pub(crate) fn replace_toc(
    conn: &Connection,
    stmts: &mut StatementCache,
    book: i64,
    toc: &mut [TocEntry],
) -> Result<()> {
    require_write_transaction(conn, "replace_toc")?;
    stmts
        .get_or_add(conn, "delete_book_toc", "DELETE FROM anthology WHERE book = ?1")?
        .execute(conn, params![book])?;

    let mut seen = HashSet::new();
    let mut position = FIRST_POSITION;
    for entry in toc.iter_mut() {
        let title = entry.title.trim();
        if title.is_empty() {
            return Err(Error::InvalidInput("table of contents entry has no title".to_string()));
        }
        let author = resolve_or_create(conn, stmts, &mut entry.author, false)?;
        if !seen.insert((author, collation_key(title))) {
            continue;
        }
        entry.id = stmts
            .get_or_add(
                conn,
                "insert_toc_entry",
                "INSERT INTO anthology (book, author, title, position) VALUES (?1, ?2, ?3, ?4)",
            )?
            .insert(conn, params![book, author, title, position])?;
        position += 1;
    }
    Ok(())
}

/// Replaces the bookshelves of `book`. Shelf links carry no position.
pub(crate) fn replace_bookshelves(
    conn: &Connection,
    stmts: &mut StatementCache,
    book: i64,
    shelves: &mut [Bookshelf],
) -> Result<()> {
    require_write_transaction(conn, "replace_bookshelves")?;
    stmts
        .get_or_add(
            conn,
            "delete_book_bookshelves",
            "DELETE FROM book_bookshelf_weak WHERE book = ?1",
        )?
        .execute(conn, params![book])?;

    let mut seen = HashSet::new();
    for shelf in shelves.iter_mut() {
        let id = resolve_or_create(conn, stmts, shelf, false)?;
        if seen.insert(id) {
            stmts
                .get_or_add(
                    conn,
                    "insert_book_bookshelf",
                    "INSERT INTO book_bookshelf_weak (book, bookshelf) VALUES (?1, ?2)",
                )?
                .execute(conn, params![book, id])?;
        }
    }
    Ok(())
}

/// A positioned link table: `(book, target, position)`.
#[derive(Debug, Clone, Copy)]
pub struct PositionedLink {
    /// Link table name.
    pub table: &'static str,
    /// Column referencing the merged entity.
    pub target: &'static str,
    /// 1-based position column.
    pub position: &'static str,
}

/// `book_author` links.
pub const BOOK_AUTHOR: PositionedLink = PositionedLink {
    table: "book_author",
    target: "author",
    position: "author_position",
};

/// `book_series` links.
pub const BOOK_SERIES: PositionedLink = PositionedLink {
    table: "book_series",
    target: "series_id",
    position: "series_position",
};

/// `anthology` rows, positioned per book.
pub const TOC: PositionedLink = PositionedLink {
    table: "anthology",
    target: "author",
    position: "position",
};

/// Redirects every `from` link in `link` to `to`.
///
/// Books linked to only `from` simply change target. For books linked to
/// both, the `from` row is dropped and the surviving `to` row takes the more
/// prominent (lower) of the two positions. Positions of every touched book
/// are then compacted to `1..=n`.
///
/// Must run inside the caller's write transaction.
///
/// # Errors
///
/// Returns [`Error::Usage`] outside a write transaction, or the mapped engine
/// error.
pub fn global_replace_positioned(
    conn: &Connection,
    link: PositionedLink,
    from: i64,
    to: i64,
) -> Result<()> {
    require_write_transaction(conn, "global_replace_positioned")?;
    let PositionedLink {
        table,
        target,
        position,
    } = link;
    let op = "global_replace_positioned";

    let touched = linked_books(conn, table, target, from)?;

    conn.execute(
        &format!(
            "UPDATE {table} SET {target} = ?2 WHERE {target} = ?1
             AND NOT EXISTS (SELECT NULL FROM {table} t2
                             WHERE t2.book = {table}.book AND t2.{target} = ?2)"
        ),
        params![from, to],
    )
    .map_err(|e| db_error(op, e))?;

    // Whatever still points at `from` belongs to a book that also links `to`.
    let clashes: Vec<(i64, i64)> = {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT book, {position} FROM {table} WHERE {target} = ?1"
            ))
            .map_err(|e| db_error(op, e))?;
        let rows = stmt
            .query_map(params![from], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| db_error(op, e))?;
        rows.collect::<rusqlite::Result<_>>()
            .map_err(|e| db_error(op, e))?
    };

    for (book, from_position) in clashes {
        let to_position: i64 = conn
            .query_row(
                &format!(
                    "SELECT min({position}) FROM {table} WHERE book = ?1 AND {target} = ?2"
                ),
                params![book, to],
                |row| row.get(0),
            )
            .map_err(|e| db_error(op, e))?;

        conn.execute(
            &format!("DELETE FROM {table} WHERE book = ?1 AND {target} = ?2"),
            params![book, from],
        )
        .map_err(|e| db_error(op, e))?;

        if to_position > from_position {
            conn.execute(
                &format!(
                    "UPDATE {table} SET {position} = ?3 WHERE book = ?1 AND {target} = ?2
                     AND {position} = ?4"
                ),
                params![book, to, from_position, to_position],
            )
            .map_err(|e| db_error(op, e))?;
        }
    }

    for book in touched {
        compact_positions(conn, link, book)?;
    }
    Ok(())
}

/// Renumbers the positions of `book` in `link` to `1..=n`, keeping order.
///
/// Rows are visited in ascending position and only ever move down into the
/// slot just vacated, so the `(book, position)` key never collides.
pub fn compact_positions(conn: &Connection, link: PositionedLink, book: i64) -> Result<()> {
    let PositionedLink {
        table, position, ..
    } = link;
    let op = "compact_positions";
    let rows: Vec<(i64, i64)> = {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT rowid, {position} FROM {table} WHERE book = ?1 ORDER BY {position}, rowid"
            ))
            .map_err(|e| db_error(op, e))?;
        let rows = stmt
            .query_map(params![book], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| db_error(op, e))?;
        rows.collect::<rusqlite::Result<_>>()
            .map_err(|e| db_error(op, e))?
    };

    for (expected, (rowid, current)) in (FIRST_POSITION..).zip(rows) {
        if current != expected {
            conn.execute(
                &format!("UPDATE {table} SET {position} = ?1 WHERE rowid = ?2"),
                params![expected, rowid],
            )
            .map_err(|e| db_error(op, e))?;
        }
    }
    Ok(())
}

/// Books linked to `id` through `table.target`.
pub(crate) fn linked_books(
    conn: &Connection,
    table: &str,
    target: &str,
    id: i64,
) -> Result<Vec<i64>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT DISTINCT book FROM {table} WHERE {target} = ?1 AND book IS NOT NULL"
        ))
        .map_err(|e| db_error("linked_books", e))?;
    let rows = stmt
        .query_map(params![id], |row| row.get(0))
        .map_err(|e| db_error("linked_books", e))?;
    rows.collect::<rusqlite::Result<_>>()
        .map_err(|e| db_error("linked_books", e))
}

/// Redirects table-of-contents entries from author `from` to `to`, dropping
/// entries that would duplicate an existing `(book, to, title)` row.
pub(crate) fn replace_toc_author(conn: &Connection, from: i64, to: i64) -> Result<()> {
    require_write_transaction(conn, "replace_toc_author")?;
    let op = "replace_toc_author";
    let touched = linked_books(conn, "anthology", "author", from)?;
    conn.execute(
        "DELETE FROM anthology WHERE author = ?1 AND EXISTS (
             SELECT NULL FROM anthology a2
             WHERE a2.book IS anthology.book AND a2.author = ?2 AND a2.title = anthology.title)",
        params![from, to],
    )
    .map_err(|e| db_error(op, e))?;
    conn.execute(
        "UPDATE anthology SET author = ?2 WHERE author = ?1",
        params![from, to],
    )
    .map_err(|e| db_error(op, e))?;
    for book in touched {
        compact_positions(conn, TOC, book)?;
    }
    Ok(())
}

/// Moves every book from shelf `from` to shelf `to`.
pub(crate) fn replace_bookshelf_links(conn: &Connection, from: i64, to: i64) -> Result<()> {
    require_write_transaction(conn, "replace_bookshelf_links")?;
    let op = "replace_bookshelf_links";
    conn.execute(
        "UPDATE book_bookshelf_weak SET bookshelf = ?2 WHERE bookshelf = ?1
         AND NOT EXISTS (SELECT NULL FROM book_bookshelf_weak w2
                         WHERE w2.book = book_bookshelf_weak.book AND w2.bookshelf = ?2)",
        params![from, to],
    )
    .map_err(|e| db_error(op, e))?;
    conn.execute(
        "DELETE FROM book_bookshelf_weak WHERE bookshelf = ?1",
        params![from],
    )
    .map_err(|e| db_error(op, e))?;
    Ok(())
}
