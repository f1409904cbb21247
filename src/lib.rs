//! # Shelfstore
//!
//! Embedded persistence layer for a single-user book catalogue.
//!
//! Books, authors, series, bookshelves, loans and table-of-contents entries
//! live in one `SQLite` store that many threads of one process share. A
//! full-text shadow index follows every book write.
//!
//! ## Features
//!
//! - Reader/writer [`Synchronizer`](storage::Synchronizer) over the single shared connection
//! - Per-session prepared statement cache keyed by logical name
//! - Get-or-create identity resolution with a locale-aware collation
//! - Ordered associations with contiguous positions and merge support
//! - FTS5 search index kept consistent inside the writing transaction
//! - Forward-only migration engine covering historical schema versions 11-82
//!
//! ## Example
//!
//! ```rust,ignore
//! use shelfstore::{Author, Book, CatalogueDb, StoreConfig};
//!
//! let db = CatalogueDb::open(StoreConfig::load_default())?;
//! let session = db.session();
//! let mut book = Book::new("Dune").with_author(Author::new("Herbert", "Frank"));
//! session.insert_book(&mut book)?;
//! let hits = session.search_books(Some("herbert"), None, None)?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
// multiple_crate_versions is inherently crate-level (detects duplicate transitive dependencies).
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod models;
pub mod observability;
pub mod storage;

// Re-exports for convenience
pub use config::{CanonicalCasing, LegacyPolicy, StoreConfig};
pub use models::{Author, Book, Bookshelf, Series, TocEntry};
pub use storage::{CatalogueDb, Session, Transaction, VersionStatus, inspect_version};

/// Error type for shelfstore operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Empty identity keys, values a column cannot hold |
/// | `OperationFailed` | `SQLite` or filesystem errors |
/// | `Usage` | API called in the wrong transaction state |
/// | `Cancelled` | A lock wait was cancelled through its token |
/// | `ConstraintViolation` | The engine rejected a write on a constraint |
/// | `LegacyVersion` | Store predates the oldest supported schema |
/// | `MigrationFailed` | A migration step failed part way |
/// | `StoreTooNew` | Store was written by a newer schema |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    ///
    /// Raised when:
    /// - An author has an empty family name or a series an empty name
    /// - A raw field value cannot be coerced to its column type
    /// - Configuration values are out of range
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    ///
    /// Raised when:
    /// - `SQLite` statements fail for reasons other than constraints
    /// - The database or config file cannot be opened
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The API was used incorrectly. These are programming defects.
    ///
    /// Raised when:
    /// - An ordered association is rewritten outside a write transaction
    /// - `begin_write` is called while this thread already has a transaction
    /// - The search index is rebuilt while a transaction is open
    /// - A cached statement receives the wrong number of parameters
    #[error("usage error: {0}")]
    Usage(String),

    /// A blocking lock wait was cancelled. No lock is held.
    #[error("operation '{operation}' cancelled while waiting for a lock")]
    Cancelled {
        /// The operation that was waiting.
        operation: String,
    },

    /// The engine reported a constraint violation; the transaction was rolled back.
    #[error("constraint violated during '{operation}': {cause}")]
    ConstraintViolation {
        /// The operation that failed.
        operation: String,
        /// The engine message.
        cause: String,
    },

    /// The store is older than the oldest schema the migration engine supports.
    ///
    /// Recoverable only by recreating the store; no transform was attempted.
    #[error(
        "store unusable: schema version {found} predates the oldest supported version {oldest_supported}"
    )]
    LegacyVersion {
        /// Version recorded in the store.
        found: u32,
        /// Oldest version the engine can upgrade.
        oldest_supported: u32,
    },

    /// A migration step failed. Steps already committed stay applied.
    #[error("store unusable: migration to version {version} failed: {cause}")]
    MigrationFailed {
        /// Target version of the failing step.
        version: u32,
        /// The underlying cause.
        cause: String,
    },

    /// The store was written by a newer schema and must not be opened for write.
    #[error("store schema version {found} is newer than the supported version {supported}")]
    StoreTooNew {
        /// Version recorded in the store.
        found: u32,
        /// Final version known to this build.
        supported: u32,
    },
}

impl Error {
    /// Returns true for errors that make the store unusable at open time.
    #[must_use]
    pub const fn is_store_unusable(&self) -> bool {
        matches!(
            self,
            Self::LegacyVersion { .. } | Self::MigrationFailed { .. } | Self::StoreTooNew { .. }
        )
    }
}

/// Result type alias for shelfstore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current UTC time formatted the way the store records it.
///
/// # Examples
///
/// ```rust
/// use shelfstore::current_timestamp;
///
/// let ts = current_timestamp();
/// assert_eq!(ts.len(), "2024-01-01 00:00:00".len());
/// ```
#[must_use]
pub fn current_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
