//! Storage layer.
//!
//! Everything runs against one shared `SQLite` connection:
//! - **Synchronization**: a reader/writer [`Synchronizer`] guards every access
//! - **Sessions**: per-session prepared statement caches over the connection
//! - **Resolution**: get-or-create of authors, series and bookshelves by natural key
//! - **Associations**: ordered link tables with contiguous positions
//! - **Search**: an FTS5 shadow index kept current by every book write
//! - **Migrations**: forward-only upgrades from historical schema versions

// Allow significant_drop_tightening - guards are held for the whole operation on purpose.
#![allow(clippy::significant_drop_tightening)]
// Allow manual_let_else for clearer error handling in some contexts.
#![allow(clippy::manual_let_else)]
// Allow missing_errors_doc for crate-internal helpers that only map engine errors.
#![allow(clippy::missing_errors_doc)]

mod association;
mod books;
mod database;
mod migrations;
mod resolver;
pub mod schema;
pub mod search;
mod session;
pub mod sqlite;
mod statements;
mod sync;

pub use association::{
    BOOK_AUTHOR, BOOK_SERIES, PositionedLink, TOC, compact_positions, global_replace_positioned,
};
pub use database::{CatalogueDb, Transaction, VersionStatus, inspect_version};
pub use migrations::MigrationOutcome;
pub use resolver::PurgeCounts;
pub use session::Session;
pub use statements::{StatementCache, StatementHandle};
pub use sync::{CancelToken, LockKind, SyncGuard, Synchronizer};
