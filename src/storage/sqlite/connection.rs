//! Connection handling for the catalogue store.
//!
//! The store shares one `rusqlite::Connection` across all threads. It lives
//! behind a `Mutex` for memory safety; logical reader/writer exclusion is the
//! job of [`crate::storage::Synchronizer`].

use super::collation::register_collations;
use crate::config::StoreConfig;
use crate::{Error, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Helper to acquire mutex lock with poison recovery.
///
/// If the mutex is poisoned (due to a panic in a previous critical section),
/// we recover the inner value and log a warning. This prevents cascading
/// failures when one operation panics.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("SQLite mutex was poisoned, recovering");
            metrics::counter!("sqlite_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Opens a read-write connection, creating the file if needed.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the file or its parent directory
/// cannot be created or opened.
pub fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::OperationFailed {
            operation: "create_database_dir".to_string(),
            cause: e.to_string(),
        })?;
    }
    Connection::open(path).map_err(|e| Error::OperationFailed {
        operation: "open_sqlite".to_string(),
        cause: format!("{}: {e}", path.display()),
    })
}

/// Opens an existing store read-only. Used to inspect the version marker.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the file cannot be opened.
pub fn open_read_only(path: &Path) -> Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| Error::OperationFailed {
        operation: "open_sqlite_read_only".to_string(),
        cause: format!("{}: {e}", path.display()),
    })
}

/// Configures a connection for the catalogue store.
///
/// # Configuration Applied
///
/// - **WAL mode**: concurrent readers alongside the single writer
/// - **NORMAL synchronous**: balances durability with performance
/// - **`busy_timeout`**: from [`StoreConfig::busy_timeout_ms`]
/// - **Statement cache**: sized to [`StoreConfig::statement_cache_capacity`]
/// - **Collations**: `LOCALIZED`
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the collation cannot be registered.
pub fn configure_connection(conn: &Connection, config: &StoreConfig) -> Result<()> {
    // In-memory stores report "memory" for journal_mode; ignore the result.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    let _ = conn.pragma_update(None, "busy_timeout", config.busy_timeout_ms);

    conn.set_prepared_statement_cache_capacity(config.statement_cache_capacity);
    register_collations(conn)
}
