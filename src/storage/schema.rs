//! Current (version 82) schema definitions.
//!
//! Everything here is idempotent: tables use `IF NOT EXISTS`, indexes and
//! triggers are dropped and recreated wholesale.

use super::sqlite::db_error;
use crate::Result;
use rusqlite::Connection;

/// Schema version written by this build.
pub const CURRENT_VERSION: u32 = 82;

/// Oldest schema version the migration engine can upgrade.
pub const OLDEST_SUPPORTED_VERSION: u32 = 11;

/// `books` table at the current version.
pub const BOOKS_DDL: &str = "CREATE TABLE IF NOT EXISTS books (
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
    language text default '',
    date_added datetime default current_timestamp,
    goodreads_book_id int,
    last_goodreads_sync_date date default '',
    book_uuid text not null default (lower(hex(randomblob(16)))),
    last_update_date datetime not null default current_timestamp
)";

/// `authors` table.
pub const AUTHORS_DDL: &str = "CREATE TABLE IF NOT EXISTS authors (
    _id integer primary key autoincrement,
    family_name text not null,
    given_names text not null
)";

/// `bookshelf` table.
pub const BOOKSHELF_DDL: &str = "CREATE TABLE IF NOT EXISTS bookshelf (
    _id integer primary key autoincrement,
    bookshelf text not null
)";

/// `loan` table.
pub const LOAN_DDL: &str = "CREATE TABLE IF NOT EXISTS loan (
    _id integer primary key autoincrement,
    book integer references books (_id) on delete set null on update set null,
    loaned_to text not null
)";

/// `anthology` (table of contents) table.
pub const ANTHOLOGY_DDL: &str = "CREATE TABLE IF NOT EXISTS anthology (
    _id integer primary key autoincrement,
    book integer references books (_id) on delete set null on update set null,
    author integer not null references authors (_id),
    title text not null,
    position int
)";

/// `series` table.
pub const SERIES_DDL: &str = "CREATE TABLE IF NOT EXISTS series (
    _id integer primary key autoincrement,
    series_name text not null
)";

/// `book_bookshelf_weak` link table.
pub const BOOK_BOOKSHELF_DDL: &str = "CREATE TABLE IF NOT EXISTS book_bookshelf_weak (
    book integer references books (_id) on delete set null on update set null,
    bookshelf integer references bookshelf (_id) on delete set null on update set null
)";

/// `book_series` link table.
pub const BOOK_SERIES_DDL: &str = "CREATE TABLE IF NOT EXISTS book_series (
    book integer references books (_id) on delete cascade on update cascade,
    series_id integer references series (_id) on delete cascade on update cascade,
    series_num text,
    series_position integer,
    primary key (book, series_position)
)";

/// `book_author` link table.
pub const BOOK_AUTHOR_DDL: &str = "CREATE TABLE IF NOT EXISTS book_author (
    book integer references books (_id) on delete cascade on update cascade,
    author integer not null references authors (_id) on delete cascade on update cascade,
    author_position integer not null,
    primary key (book, author_position)
)";

/// Column list of the search index, in insert order.
pub const FTS_COLUMNS: &str =
    "author_name, title, description, notes, publisher, genre, location, isbn";

/// Returns the DDL for a search index table called `name`.
#[must_use]
pub fn fts_ddl(name: &str) -> String {
    format!("CREATE VIRTUAL TABLE {name} USING fts5({FTS_COLUMNS})")
}

/// Core tables, in creation order.
pub const TABLES: &[(&str, &str)] = &[
    ("authors", AUTHORS_DDL),
    ("bookshelf", BOOKSHELF_DDL),
    ("books", BOOKS_DDL),
    ("loan", LOAN_DDL),
    ("anthology", ANTHOLOGY_DDL),
    ("series", SERIES_DDL),
    ("book_series", BOOK_SERIES_DDL),
    ("book_author", BOOK_AUTHOR_DDL),
    ("book_bookshelf_weak", BOOK_BOOKSHELF_DDL),
];

/// Every index of the current schema.
pub const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS authors_given_names ON authors (given_names)",
    "CREATE INDEX IF NOT EXISTS authors_given_names_ci ON authors (given_names COLLATE LOCALIZED)",
    "CREATE INDEX IF NOT EXISTS authors_family_name ON authors (family_name)",
    "CREATE INDEX IF NOT EXISTS authors_family_name_ci ON authors (family_name COLLATE LOCALIZED)",
    "CREATE INDEX IF NOT EXISTS bookshelf_bookshelf ON bookshelf (bookshelf)",
    "CREATE INDEX IF NOT EXISTS books_title ON books (title)",
    "CREATE INDEX IF NOT EXISTS books_title_ci ON books (title COLLATE LOCALIZED)",
    "CREATE INDEX IF NOT EXISTS books_isbn ON books (isbn)",
    "CREATE INDEX IF NOT EXISTS books_publisher ON books (publisher)",
    "CREATE UNIQUE INDEX IF NOT EXISTS books_uuid ON books (book_uuid)",
    "CREATE INDEX IF NOT EXISTS books_gr_book ON books (goodreads_book_id)",
    "CREATE INDEX IF NOT EXISTS anthology_book ON anthology (book)",
    "CREATE INDEX IF NOT EXISTS anthology_author ON anthology (author)",
    "CREATE INDEX IF NOT EXISTS anthology_title ON anthology (title)",
    "CREATE UNIQUE INDEX IF NOT EXISTS series_series ON series (_id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS loan_book_loaned_to ON loan (book)",
    "CREATE INDEX IF NOT EXISTS book_bookshelf_weak_book ON book_bookshelf_weak (book)",
    "CREATE INDEX IF NOT EXISTS book_bookshelf_weak_bookshelf ON book_bookshelf_weak (bookshelf)",
    "CREATE UNIQUE INDEX IF NOT EXISTS book_series_series ON book_series (series_id, book, series_num)",
    "CREATE UNIQUE INDEX IF NOT EXISTS book_series_book ON book_series (book, series_id, series_num)",
    "CREATE UNIQUE INDEX IF NOT EXISTS book_author_author ON book_author (author, book)",
    "CREATE UNIQUE INDEX IF NOT EXISTS book_author_book ON book_author (book, author)",
    "CREATE UNIQUE INDEX IF NOT EXISTS anthology_pk_idx ON anthology (book, author, title)",
];

/// Triggers of the current schema as `(name, body)`.
pub const TRIGGERS: &[(&str, &str)] = &[(
    "books_tg_reset_goodreads",
    "AFTER UPDATE OF isbn ON books FOR EACH ROW
     WHEN new.isbn IS NOT old.isbn
     BEGIN
         UPDATE books SET goodreads_book_id = 0, last_goodreads_sync_date = ''
         WHERE _id = new._id;
     END",
)];

/// Creates every table, index and trigger plus the search index, and seeds
/// the default bookshelf.
///
/// # Errors
///
/// Returns the mapped engine error of the first failing statement.
pub fn create_all(conn: &Connection) -> Result<()> {
    for (name, ddl) in TABLES {
        conn.execute_batch(ddl)
            .map_err(|e| db_error(&format!("create_table_{name}"), e))?;
    }
    conn.execute(
        "INSERT INTO bookshelf (bookshelf) SELECT ?1
         WHERE NOT EXISTS (SELECT NULL FROM bookshelf)",
        [crate::models::Bookshelf::DEFAULT_NAME],
    )
    .map_err(|e| db_error("seed_default_bookshelf", e))?;
    ensure_search_table(conn)?;
    recreate_indexes(conn);
    recreate_triggers(conn)
}

/// Creates `books_fts` if it does not exist.
///
/// # Errors
///
/// Returns the mapped engine error if creation fails.
pub fn ensure_search_table(conn: &Connection) -> Result<()> {
    if !table_exists(conn, "books_fts")? {
        conn.execute_batch(&fts_ddl("books_fts"))
            .map_err(|e| db_error("create_books_fts", e))?;
    }
    Ok(())
}

/// Drops every explicitly created index and recreates the current set.
///
/// Individual failures are logged and skipped; a missing index costs speed,
/// not correctness.
pub fn recreate_indexes(conn: &Connection) {
    let existing: Vec<String> = match conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND sql IS NOT NULL")
        .and_then(|mut stmt| {
            stmt.query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()
        }) {
        Ok(names) => names,
        Err(e) => {
            tracing::warn!(error = %e, "could not list indexes");
            Vec::new()
        },
    };

    for name in existing {
        if let Err(e) = conn.execute_batch(&format!("DROP INDEX IF EXISTS \"{name}\"")) {
            tracing::warn!(index = %name, error = %e, "failed to drop index");
        }
    }

    for sql in INDEXES {
        if let Err(e) = conn.execute_batch(sql) {
            tracing::warn!(sql, error = %e, "failed to create index");
        }
    }
}

/// Drops and recreates every trigger.
///
/// # Errors
///
/// Returns the mapped engine error if a trigger cannot be created.
pub fn recreate_triggers(conn: &Connection) -> Result<()> {
    for (name, body) in TRIGGERS {
        conn.execute_batch(&format!("DROP TRIGGER IF EXISTS {name}; CREATE TRIGGER {name} {body};"))
            .map_err(|e| db_error(&format!("create_trigger_{name}"), e))?;
    }
    Ok(())
}

/// Returns true if a table (or virtual table) called `name` exists.
///
/// # Errors
///
/// Returns the mapped engine error if the catalog cannot be read.
pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
    .map_err(|e| db_error("table_exists", e))
}

/// Returns the column names of `table` in declaration order.
///
/// # Errors
///
/// Returns the mapped engine error if the table info cannot be read.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info(\"{table}\")"))
        .map_err(|e| db_error("table_info", e))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| db_error("table_info", e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| db_error("table_info", e))
}

/// Returns true if `table` has a column called `column`.
///
/// # Errors
///
/// Returns the mapped engine error if the table info cannot be read.
pub fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    Ok(table_columns(conn, table)?
        .iter()
        .any(|c| c.eq_ignore_ascii_case(column)))
}
