//! The ordered list of schema transforms from version 11 to 82.
//!
//! Each step brings the store from the previous entry's version to its own
//! `version`. Versions with no entry changed nothing this layer stores.

use super::helpers::{
    add_column_if_missing, create_if_missing, drop_columns, exec, recreate_and_reload,
};
use crate::Result;
use crate::config::{CanonicalCasing, LegacyPolicy};
use crate::models::Bookshelf;
use crate::storage::association::{
    BOOK_AUTHOR, BOOK_SERIES, PositionedLink, compact_positions, global_replace_positioned,
    replace_toc_author,
};
use crate::storage::schema::{
    ANTHOLOGY_DDL, AUTHORS_DDL, BOOK_AUTHOR_DDL, BOOK_BOOKSHELF_DDL, BOOK_SERIES_DDL, BOOKS_DDL,
    BOOKSHELF_DDL, LOAN_DDL, SERIES_DDL, fts_ddl, has_column,
};
use crate::storage::search::INDEX_TABLE;
use crate::storage::sqlite::{collation_key, db_error};
use rusqlite::{Connection, params};
use std::collections::BTreeMap;

/// What a step asks of the engine once every step has committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepEffect {
    /// Nothing further.
    Done,
    /// The search index must be rebuilt from the row store.
    RebuildSearchIndex,
}

type Apply = fn(&Connection, &LegacyPolicy) -> Result<StepEffect>;

/// A single forward-only transform.
#[derive(Clone, Copy)]
pub(crate) struct MigrationStep {
    /// Version the store is at once the step commits.
    pub version: u32,
    /// Human-readable description, logged as the step runs.
    pub description: &'static str,
    /// The transform itself. Runs inside the step's transaction.
    pub apply: Apply,
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

const fn step(version: u32, description: &'static str, apply: Apply) -> MigrationStep {
    MigrationStep {
        version,
        description,
        apply,
    }
}

/// Every step, in ascending version order.
pub(crate) const STEPS: &[MigrationStep] = &[
    step(12, "add series number", add_series_number),
    step(20, "add notes", add_notes),
    step(21, "create loans", create_loans),
    step(25, "repeat notes and loans", repeat_notes_and_loans),
    step(29, "add list price", add_list_price),
    step(33, "create anthology", create_anthology),
    step(35, "add location, reading dates, audiobook and signed", add_reading_columns),
    step(36, "blank reading columns", blank_reading_columns),
    step(39, "drop loans to nobody", drop_blank_loans),
    step(42, "move bookshelf into link table", move_bookshelf_links),
    step(44, "deduplicate anthology", dedupe_anthology),
    step(45, "audiobook flag becomes format", audiobook_to_format),
    step(46, "drop loans to 'null'", drop_null_loans),
    step(47, "add description and genre", add_description_and_genre),
    step(49, "keep newest loan and anthology row", keep_newest_rows),
    step(54, "normalise authors and series", normalise),
    step(56, "normalise authors and series (repair)", normalise),
    step(58, "create missing tables", repair_tables),
    step(59, "drop incomplete loans", drop_incomplete_loans),
    step(64, "read flag becomes integer", read_flag_to_integer),
    step(65, "signed flag becomes integer, add date added", signed_flag_to_integer),
    step(67, "recreate search index", recreate_search_index),
    step(69, "add goodreads book id", add_goodreads_id),
    step(71, "rebuild books with uuid and update dates", rebuild_books_v71),
    step(75, "merge case variants and fix positions", merge_case_variants),
    step(76, "schedule search rebuild", schedule_rebuild),
    step(80, "schedule search rebuild", schedule_rebuild),
    step(81, "series number becomes text", series_number_to_text),
    step(82, "add language", rebuild_books_current),
];

/// `books` as rebuilt at version 71; the current shape minus `language`.
const BOOKS_V71_DDL: &str = "CREATE TABLE books (
    _id integer primary key autoincrement,
    title text not null,
    isbn text,
    publisher text,
    date_published date,
    rating float not null default 0,
    read boolean not null default 0,
    pages int,
    notes text,
    list_price text,
    anthology int not null default 0,
    location text,
    read_start date,
    read_end date,
    format text,
    signed boolean not null default 0,
    description text,
    genre text,
    date_added datetime default current_timestamp,
    goodreads_book_id int,
    last_goodreads_sync_date date default '',
    book_uuid text not null default (lower(hex(randomblob(16)))),
    last_update_date datetime not null default current_timestamp
)";

fn add_series_number(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    add_column_if_missing(conn, "books", "series_num", "text")?;
    exec(conn, "blank_series_num", "UPDATE books SET series_num = '' WHERE series_num IS NULL")?;
    Ok(StepEffect::Done)
}

fn add_notes(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    add_column_if_missing(conn, "books", "notes", "text")?;
    exec(conn, "blank_notes", "UPDATE books SET notes = '' WHERE notes IS NULL")?;
    Ok(StepEffect::Done)
}

fn create_loans(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    exec(conn, "create_loan", LOAN_DDL)?;
    Ok(StepEffect::Done)
}

fn repeat_notes_and_loans(conn: &Connection, policy: &LegacyPolicy) -> Result<StepEffect> {
    add_notes(conn, policy)?;
    create_loans(conn, policy)
}

fn add_list_price(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    add_column_if_missing(conn, "books", "list_price", "text")?;
    Ok(StepEffect::Done)
}

fn create_anthology(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    exec(conn, "create_anthology", ANTHOLOGY_DDL)?;
    add_column_if_missing(conn, "books", "anthology", "int not null default 0")?;
    Ok(StepEffect::Done)
}

fn add_reading_columns(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    for (column, definition) in [
        ("location", "text"),
        ("read_start", "date"),
        ("read_end", "date"),
        ("audiobook", "boolean not null default 'f'"),
        ("signed", "boolean not null default 'f'"),
    ] {
        add_column_if_missing(conn, "books", column, definition)?;
    }
    Ok(StepEffect::Done)
}

fn blank_reading_columns(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    exec(
        conn,
        "blank_reading_columns",
        "UPDATE books SET location = '', read_start = '', read_end = '',
                          audiobook = 'f', signed = 'f'",
    )?;
    Ok(StepEffect::Done)
}

fn drop_blank_loans(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    exec(conn, "drop_blank_loans", "DELETE FROM loan WHERE loaned_to IN ('', 'null')")?;
    Ok(StepEffect::Done)
}

fn move_bookshelf_links(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    exec(conn, "create_book_bookshelf", BOOK_BOOKSHELF_DDL)?;
    if has_column(conn, "books", "bookshelf")? {
        exec(
            conn,
            "move_bookshelf_links",
            "INSERT INTO book_bookshelf_weak (book, bookshelf)
             SELECT _id, bookshelf FROM books b
             WHERE bookshelf IS NOT NULL
               AND NOT EXISTS (SELECT NULL FROM book_bookshelf_weak w
                               WHERE w.book = b._id AND w.bookshelf = b.bookshelf)",
        )?;
        drop_columns(conn, "books", &["bookshelf"])?;
    }
    Ok(StepEffect::Done)
}

fn dedupe_anthology(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    exec(
        conn,
        "dedupe_anthology",
        "DELETE FROM anthology WHERE _id IN (
             SELECT a._id FROM anthology a, anthology b
             WHERE a.book = b.book AND a.author = b.author AND a.title = b.title
               AND a._id > b._id);
         CREATE UNIQUE INDEX IF NOT EXISTS anthology_pk_idx ON anthology (book, author, title);",
    )?;
    Ok(StepEffect::Done)
}

fn audiobook_to_format(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    let added = add_column_if_missing(conn, "books", "format", "text")?;
    if added && has_column(conn, "books", "audiobook")? {
        exec(
            conn,
            "audiobook_to_format",
            "UPDATE books SET format =
                 CASE WHEN audiobook IN ('t', 1) THEN 'Audiobook' ELSE 'Paperback' END",
        )?;
    }
    drop_columns(conn, "books", &["audiobook"])?;
    Ok(StepEffect::Done)
}

fn drop_null_loans(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    exec(conn, "drop_null_loans", "DELETE FROM loan WHERE loaned_to = 'null'")?;
    Ok(StepEffect::Done)
}

fn add_description_and_genre(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    add_column_if_missing(conn, "books", "description", "text")?;
    add_column_if_missing(conn, "books", "genre", "text")?;
    Ok(StepEffect::Done)
}

fn keep_newest_rows(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    exec(
        conn,
        "keep_newest_rows",
        "DELETE FROM loan WHERE _id NOT IN (SELECT max(_id) FROM loan GROUP BY book);
         DELETE FROM anthology WHERE _id NOT IN (
             SELECT max(_id) FROM anthology GROUP BY book, author, title);",
    )?;
    Ok(StepEffect::Done)
}

/// Moves the legacy single-author and single-series columns of `books` into
/// the link tables, then rebuilds `books` without them.
///
/// Case-variant series names collapse into one row whose spelling follows
/// the casing policy. A no-op once the legacy columns are gone.
fn normalise(conn: &Connection, policy: &LegacyPolicy) -> Result<StepEffect> {
    let has_author = has_column(conn, "books", "author")?;
    let has_series = has_column(conn, "books", "series")?;
    if !has_author && !has_series {
        return Ok(StepEffect::Done);
    }
    exec(
        conn,
        "create_link_tables",
        &format!("{SERIES_DDL}; {BOOK_SERIES_DDL}; {BOOK_AUTHOR_DDL};"),
    )?;

    if has_series {
        let aggregate = policy.canonical_casing.aggregate();
        exec(
            conn,
            "normalise_series",
            &format!(
                "INSERT INTO series (series_name)
                 SELECT {aggregate}(series) FROM books b
                 WHERE coalesce(series, '') <> ''
                   AND NOT EXISTS (SELECT NULL FROM series s
                                   WHERE s.series_name = b.series COLLATE LOCALIZED)
                 GROUP BY series COLLATE LOCALIZED"
            ),
        )?;
        let number = if has_column(conn, "books", "series_num")? {
            "trim(coalesce(b.series_num, ''))"
        } else {
            "''"
        };
        exec(
            conn,
            "normalise_book_series",
            &format!(
                "INSERT OR IGNORE INTO book_series (book, series_id, series_num, series_position)
                 SELECT b._id,
                        (SELECT min(s._id) FROM series s
                         WHERE s.series_name = b.series COLLATE LOCALIZED),
                        {number}, 1
                 FROM books b WHERE coalesce(b.series, '') <> ''"
            ),
        )?;
    }

    if has_author {
        exec(
            conn,
            "normalise_book_author",
            "INSERT OR IGNORE INTO book_author (book, author, author_position)
             SELECT _id, author, 1 FROM books WHERE author IS NOT NULL",
        )?;
    }

    drop_columns(conn, "books", &["author", "series", "series_num"])?;
    tracing::info!("legacy author and series columns normalised");
    Ok(StepEffect::Done)
}

fn repair_tables(conn: &Connection, policy: &LegacyPolicy) -> Result<StepEffect> {
    for (table, ddl) in [
        ("authors", AUTHORS_DDL),
        ("loan", LOAN_DDL),
        ("anthology", ANTHOLOGY_DDL),
        ("series", SERIES_DDL),
        ("book_series", BOOK_SERIES_DDL),
        ("book_author", BOOK_AUTHOR_DDL),
        ("book_bookshelf_weak", BOOK_BOOKSHELF_DDL),
    ] {
        if create_if_missing(conn, table, ddl)? {
            tracing::warn!(table, "recreated missing table");
        }
    }
    if create_if_missing(conn, "bookshelf", BOOKSHELF_DDL)? {
        tracing::warn!(table = "bookshelf", "recreated missing table");
        conn.execute(
            "INSERT INTO bookshelf (bookshelf) VALUES (?1)",
            params![Bookshelf::DEFAULT_NAME],
        )
        .map_err(|e| db_error("seed_default_bookshelf", e))?;
    }
    normalise(conn, policy)
}

fn drop_incomplete_loans(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    exec(
        conn,
        "drop_incomplete_loans",
        "DELETE FROM loan
         WHERE book IS NULL OR book = '' OR loaned_to IS NULL OR loaned_to = ''",
    )?;
    Ok(StepEffect::Done)
}

fn flag_to_integer(conn: &Connection, column: &str) -> Result<()> {
    exec(
        conn,
        "flag_to_integer",
        &format!(
            "UPDATE books SET {column} = 0 WHERE {column} = 'f';
             UPDATE books SET {column} = 1 WHERE {column} = 't';"
        ),
    )
}

fn read_flag_to_integer(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    flag_to_integer(conn, "read")?;
    Ok(StepEffect::Done)
}

fn signed_flag_to_integer(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    flag_to_integer(conn, "signed")?;
    add_column_if_missing(conn, "books", "date_added", "datetime")?;
    Ok(StepEffect::Done)
}

fn recreate_search_index(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    exec(
        conn,
        "recreate_search_index",
        &format!("DROP TABLE IF EXISTS {INDEX_TABLE}; {};", fts_ddl(INDEX_TABLE)),
    )?;
    Ok(StepEffect::RebuildSearchIndex)
}

fn add_goodreads_id(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    add_column_if_missing(conn, "books", "goodreads_book_id", "int")?;
    Ok(StepEffect::Done)
}

fn rebuild_books_v71(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    recreate_and_reload(conn, "books", BOOKS_V71_DDL, &[])?;
    Ok(StepEffect::Done)
}

/// Books whose positions in `link` do not run `1..=n`.
fn books_with_position_gaps(conn: &Connection, link: PositionedLink) -> Result<Vec<i64>> {
    let PositionedLink {
        table, position, ..
    } = link;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT book FROM {table} WHERE book IS NOT NULL GROUP BY book
             HAVING min({position}) <> 1 OR max({position}) <> count(*)"
        ))
        .map_err(|e| db_error("position_gaps", e))?;
    let rows = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| db_error("position_gaps", e))?;
    rows.collect::<rusqlite::Result<_>>()
        .map_err(|e| db_error("position_gaps", e))
}

/// Groups rows by collation key, keeping id order inside each group.
fn case_variant_groups<K: Ord>(
    rows: Vec<(i64, K)>,
    key: impl Fn(&K) -> String,
) -> Vec<Vec<(i64, K)>> {
    let mut groups: BTreeMap<String, Vec<(i64, K)>> = BTreeMap::new();
    for row in rows {
        groups.entry(key(&row.1)).or_default().push(row);
    }
    groups.into_values().filter(|g| g.len() > 1).collect()
}

fn canonical<K: Ord + Clone>(casing: CanonicalCasing, group: &[(i64, K)]) -> Option<K> {
    let spellings = group.iter().map(|(_, k)| k);
    match casing {
        CanonicalCasing::Max => spellings.max().cloned(),
        CanonicalCasing::Min => spellings.min().cloned(),
    }
}

fn merge_duplicate_authors(conn: &Connection, casing: CanonicalCasing) -> Result<usize> {
    let rows: Vec<(i64, (String, String))> = {
        let mut stmt = conn
            .prepare("SELECT _id, family_name, given_names FROM authors ORDER BY _id")
            .map_err(|e| db_error("merge_authors", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, (row.get(1)?, row.get(2)?))))
            .map_err(|e| db_error("merge_authors", e))?;
        rows.collect::<rusqlite::Result<_>>()
            .map_err(|e| db_error("merge_authors", e))?
    };

    let mut merged = 0;
    for group in case_variant_groups(rows, |(family, given)| {
        format!("{}\u{0}{}", collation_key(family), collation_key(given))
    }) {
        let Some(((keeper, _), rest)) = group.split_first() else {
            continue;
        };
        if let Some((family, given)) = canonical(casing, &group) {
            conn.execute(
                "UPDATE authors SET family_name = ?2, given_names = ?3 WHERE _id = ?1",
                params![keeper, family, given],
            )
            .map_err(|e| db_error("merge_authors", e))?;
        }
        for (duplicate, _) in rest {
            replace_toc_author(conn, *duplicate, *keeper)?;
            global_replace_positioned(conn, BOOK_AUTHOR, *duplicate, *keeper)?;
            conn.execute("DELETE FROM authors WHERE _id = ?1", params![duplicate])
                .map_err(|e| db_error("merge_authors", e))?;
            merged += 1;
        }
    }
    Ok(merged)
}

fn merge_duplicate_series(conn: &Connection, casing: CanonicalCasing) -> Result<usize> {
    let rows: Vec<(i64, String)> = {
        let mut stmt = conn
            .prepare("SELECT _id, series_name FROM series ORDER BY _id")
            .map_err(|e| db_error("merge_series", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| db_error("merge_series", e))?;
        rows.collect::<rusqlite::Result<_>>()
            .map_err(|e| db_error("merge_series", e))?
    };

    let mut merged = 0;
    for group in case_variant_groups(rows, |name| collation_key(name)) {
        let Some(((keeper, _), rest)) = group.split_first() else {
            continue;
        };
        if let Some(name) = canonical(casing, &group) {
            conn.execute(
                "UPDATE series SET series_name = ?2 WHERE _id = ?1",
                params![keeper, name],
            )
            .map_err(|e| db_error("merge_series", e))?;
        }
        for (duplicate, _) in rest {
            global_replace_positioned(conn, BOOK_SERIES, *duplicate, *keeper)?;
            conn.execute("DELETE FROM series WHERE _id = ?1", params![duplicate])
                .map_err(|e| db_error("merge_series", e))?;
            merged += 1;
        }
    }
    Ok(merged)
}

fn merge_case_variants(conn: &Connection, policy: &LegacyPolicy) -> Result<StepEffect> {
    if policy.merge_duplicate_entities {
        let authors = merge_duplicate_authors(conn, policy.canonical_casing)?;
        let series = merge_duplicate_series(conn, policy.canonical_casing)?;
        tracing::info!(authors, series, "case-variant duplicates merged");
    }
    for link in [BOOK_AUTHOR, BOOK_SERIES] {
        for book in books_with_position_gaps(conn, link)? {
            compact_positions(conn, link, book)?;
        }
    }
    Ok(StepEffect::RebuildSearchIndex)
}

fn schedule_rebuild(_: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    Ok(StepEffect::RebuildSearchIndex)
}

fn series_number_to_text(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    recreate_and_reload(conn, "book_series", BOOK_SERIES_DDL, &[])?;
    Ok(StepEffect::Done)
}

fn rebuild_books_current(conn: &Connection, _: &LegacyPolicy) -> Result<StepEffect> {
    recreate_and_reload(conn, "books", BOOKS_DDL, &[])?;
    Ok(StepEffect::Done)
}
