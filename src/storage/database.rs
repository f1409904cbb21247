//! The catalogue store: one shared connection, its synchronizer and the
//! transaction bookkeeping.

use super::migrations;
use super::schema::{self, CURRENT_VERSION, OLDEST_SUPPORTED_VERSION};
use super::search;
use super::session::Session;
use super::sqlite::{acquire_lock, configure_connection, db_error, open_connection, open_read_only};
use super::sync::{CancelToken, LockKind, SyncGuard, Synchronizer};
use crate::config::StoreConfig;
use crate::{Error, Result};
use rusqlite::Connection;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::{self, ThreadId};
use tracing::instrument;

/// Classification of a store's version marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionStatus {
    /// No schema yet; opening creates it.
    Empty,
    /// At [`CURRENT_VERSION`].
    Current,
    /// Upgradable from the contained version.
    NeedsMigration(u32),
    /// Written by a newer build; do not open for write.
    TooNew(u32),
    /// Older than [`OLDEST_SUPPORTED_VERSION`].
    Legacy(u32),
}

impl VersionStatus {
    /// Returns true when the store can be opened by this build.
    #[must_use]
    pub const fn is_openable(self) -> bool {
        matches!(self, Self::Empty | Self::Current | Self::NeedsMigration(_))
    }
}

/// Reads the version marker without writing anything.
///
/// A missing file is reported as [`VersionStatus::Empty`].
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the file exists but cannot be read.
pub fn inspect_version(path: &Path) -> Result<VersionStatus> {
    if !path.exists() {
        return Ok(VersionStatus::Empty);
    }
    let conn = open_read_only(path)?;
    classify(&conn)
}

/// Reads `PRAGMA user_version`.
pub(crate) fn read_version(conn: &Connection) -> Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))
        .map_err(|e| db_error("read_user_version", e))
}

pub(crate) fn classify(conn: &Connection) -> Result<VersionStatus> {
    let version = read_version(conn)?;
    Ok(match version {
        0 if !schema::table_exists(conn, "books")? => VersionStatus::Empty,
        v if v == CURRENT_VERSION => VersionStatus::Current,
        v if v > CURRENT_VERSION => VersionStatus::TooNew(v),
        v if v < OLDEST_SUPPORTED_VERSION => VersionStatus::Legacy(v),
        v => VersionStatus::NeedsMigration(v),
    })
}

/// A catalogue store shared by every thread of the process.
///
/// Wrap it in an `Arc` (or use scoped threads) and give each caller its own
/// [`Session`].
#[derive(Debug)]
pub struct CatalogueDb {
    conn: Mutex<Connection>,
    sync: Synchronizer,
    /// Open explicit or implicit transactions, by owning thread.
    tx: Mutex<HashMap<ThreadId, LockKind>>,
    config: StoreConfig,
    db_path: Option<PathBuf>,
}

impl CatalogueDb {
    /// Opens (creating or migrating as needed) the store at
    /// `config.database_path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LegacyVersion`], [`Error::StoreTooNew`] or
    /// [`Error::MigrationFailed`] when the store is unusable, or
    /// [`Error::OperationFailed`] for I/O failures.
    #[instrument(skip(config), fields(operation = "open", backend = "sqlite", path = %config.database_path.display()))]
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let path = config.database_path.clone();
        let conn = open_connection(&path)?;
        Self::from_connection(conn, config, Some(path))
    }

    /// Creates an in-memory store (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let conn = Connection::open_in_memory().map_err(|e| Error::OperationFailed {
            operation: "open_sqlite_memory".to_string(),
            cause: e.to_string(),
        })?;
        Self::from_connection(conn, config, None)
    }

    fn from_connection(conn: Connection, config: StoreConfig, db_path: Option<PathBuf>) -> Result<Self> {
        configure_connection(&conn, &config)?;
        let db = Self {
            conn: Mutex::new(conn),
            sync: Synchronizer::new(),
            tx: Mutex::new(HashMap::new()),
            config,
            db_path,
        };
        db.prepare_schema()?;
        Ok(db)
    }

    /// Brings the schema to [`CURRENT_VERSION`] under the exclusive lock.
    fn prepare_schema(&self) -> Result<()> {
        let _guard = self.sync.acquire_exclusive("prepare_schema", None)?;
        let conn = acquire_lock(&self.conn);

        let rebuild = match classify(&conn)? {
            VersionStatus::Empty => {
                tracing::info!(version = CURRENT_VERSION, "creating catalogue schema");
                run_in_transaction(&conn, "create_schema", |conn| {
                    schema::create_all(conn)?;
                    conn.pragma_update(None, "user_version", CURRENT_VERSION)
                        .map_err(|e| db_error("write_user_version", e))
                })?;
                false
            },
            VersionStatus::Current => {
                schema::ensure_search_table(&conn)?;
                false
            },
            VersionStatus::NeedsMigration(from) => {
                migrations::migrate(&conn, from, &self.config.legacy)?.rebuild_search_index
            },
            VersionStatus::TooNew(found) => {
                return Err(Error::StoreTooNew {
                    found,
                    supported: CURRENT_VERSION,
                });
            },
            VersionStatus::Legacy(found) => {
                return Err(Error::LegacyVersion {
                    found,
                    oldest_supported: OLDEST_SUPPORTED_VERSION,
                });
            },
        };

        // Still holding the exclusive lock, with no transaction open.
        if rebuild {
            search::rebuild_all(&conn, self.statement_capacity())?;
        }
        Ok(())
    }

    /// Creates a session with its own statement cache.
    #[must_use]
    pub fn session(&self) -> Session<'_> {
        Session::new(self, self.statement_capacity())
    }

    /// Returns the configuration the store was opened with.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the database path (None for in-memory stores).
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Reads the schema version marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be read.
    pub fn schema_version(&self) -> Result<u32> {
        let _guard = self.sync.acquire_shared("schema_version", None)?;
        read_version(&acquire_lock(&self.conn))
    }

    /// Returns true if the calling thread has a transaction open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.current_tx().is_some()
    }

    /// Starts a read-write transaction on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Usage`] if this thread already has a transaction,
    /// [`Error::Cancelled`] if `cancel` fires while waiting.
    pub fn begin_write(&self, cancel: Option<&CancelToken>) -> Result<Transaction<'_>> {
        self.begin(LockKind::Exclusive, cancel)
    }

    /// Starts a read-only transaction on the calling thread.
    ///
    /// # Errors
    ///
    /// As for [`begin_write`](Self::begin_write).
    pub fn begin_read(&self, cancel: Option<&CancelToken>) -> Result<Transaction<'_>> {
        self.begin(LockKind::Shared, cancel)
    }

    fn begin(&self, kind: LockKind, cancel: Option<&CancelToken>) -> Result<Transaction<'_>> {
        if self.in_transaction() {
            return Err(Error::Usage("transaction already started".to_string()));
        }
        let guard = match kind {
            LockKind::Shared => self.sync.acquire_shared("begin_read", cancel)?,
            LockKind::Exclusive => self.sync.acquire_exclusive("begin_write", cancel)?,
        };
        if kind == LockKind::Exclusive {
            acquire_lock(&self.conn)
                .execute_batch("BEGIN IMMEDIATE")
                .map_err(|e| db_error("begin_transaction", e))?;
        }
        self.set_tx(Some(kind));
        Ok(Transaction {
            db: self,
            kind,
            finished: false,
            _guard: guard,
        })
    }

    fn current_tx(&self) -> Option<LockKind> {
        acquire_lock(&self.tx).get(&thread::current().id()).copied()
    }

    fn set_tx(&self, kind: Option<LockKind>) {
        let owner = thread::current().id();
        let mut open = acquire_lock(&self.tx);
        match kind {
            Some(kind) => {
                open.insert(owner, kind);
            },
            None => {
                open.remove(&owner);
            },
        }
    }

    fn statement_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.config.statement_cache_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Runs `f` under a shared lock.
    pub(crate) fn read<T>(
        &self,
        operation: &'static str,
        cancel: Option<&CancelToken>,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.sync.acquire_shared(operation, cancel)?;
        let conn = acquire_lock(&self.conn);
        f(&conn)
    }

    /// Runs `f` under the exclusive lock inside a write transaction.
    ///
    /// Joins the calling thread's open write transaction if there is one;
    /// otherwise begins, and commits or rolls back, its own.
    pub(crate) fn write<T>(
        &self,
        operation: &'static str,
        cancel: Option<&CancelToken>,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        // Checked before waiting: another thread's read transaction would
        // never release while this one holds its own.
        match self.current_tx() {
            Some(LockKind::Shared) => {
                return Err(Error::Usage(format!(
                    "'{operation}' writes inside a read-only transaction"
                )));
            },
            Some(LockKind::Exclusive) => {
                let _guard = self.sync.acquire_exclusive(operation, cancel)?;
                return f(&acquire_lock(&self.conn));
            },
            None => {},
        }

        let _guard = self.sync.acquire_exclusive(operation, cancel)?;
        let conn = acquire_lock(&self.conn);
        self.set_tx(Some(LockKind::Exclusive));
        let _open = ImplicitTransaction { db: self };
        run_in_transaction(&conn, operation, f)
    }

    /// Runs `f` under the exclusive lock with no transaction open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Usage`] if the calling thread has a transaction open.
    pub(crate) fn exclusive_outside_transaction<T>(
        &self,
        operation: &'static str,
        cancel: Option<&CancelToken>,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        if self.in_transaction() {
            return Err(Error::Usage(format!(
                "'{operation}' cannot run inside a transaction"
            )));
        }
        let _guard = self.sync.acquire_exclusive(operation, cancel)?;
        let conn = acquire_lock(&self.conn);
        f(&conn)
    }
}

/// Clears the thread's transaction marker when an implicit write ends,
/// including by unwinding.
struct ImplicitTransaction<'a> {
    db: &'a CatalogueDb,
}

impl Drop for ImplicitTransaction<'_> {
    fn drop(&mut self) {
        self.db.set_tx(None);
    }
}

/// Runs `f` between `BEGIN IMMEDIATE` and `COMMIT`, rolling back on error.
pub(crate) fn run_in_transaction<T>(
    conn: &Connection,
    operation: &str,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| db_error("begin_transaction", e))?;
    let mut scope = RollbackOnDrop { conn, armed: true };

    let value = f(conn)?;
    conn.execute_batch("COMMIT")
        .map_err(|e| db_error("commit_transaction", e))?;
    scope.armed = false;
    tracing::trace!(operation, "transaction committed");
    Ok(value)
}

/// Rolls back the open transaction unless disarmed. Covers both the error
/// and the unwinding path.
struct RollbackOnDrop<'c> {
    conn: &'c Connection,
    armed: bool,
}

impl Drop for RollbackOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed && !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "rollback failed");
            }
        }
    }
}

/// An explicit transaction for multi-step operations.
///
/// Session operations called on the owning thread join it. Dropping an
/// uncommitted write transaction rolls it back.
#[derive(Debug)]
#[must_use = "an unused transaction is rolled back immediately"]
pub struct Transaction<'a> {
    db: &'a CatalogueDb,
    kind: LockKind,
    finished: bool,
    _guard: SyncGuard<'a>,
}

impl Transaction<'_> {
    /// The lock kind held for the transaction's duration.
    #[must_use]
    pub const fn kind(&self) -> LockKind {
        self.kind
    }

    /// Commits the transaction and releases the lock.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error; the transaction is then rolled back.
    pub fn commit(mut self) -> Result<()> {
        self.finish("COMMIT")
    }

    /// Rolls the transaction back and releases the lock.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error.
    pub fn rollback(mut self) -> Result<()> {
        self.finish("ROLLBACK")
    }

    fn finish(&mut self, verb: &str) -> Result<()> {
        self.finished = true;
        self.db.set_tx(None);
        if self.kind == LockKind::Shared {
            return Ok(());
        }
        let conn = acquire_lock(&self.db.conn);
        conn.execute_batch(verb).map_err(|e| {
            if !conn.is_autocommit() {
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    tracing::warn!(verb, error = %rollback, "rollback after failed transaction end failed");
                }
            }
            db_error(if verb == "COMMIT" { "commit_transaction" } else { "rollback_transaction" }, e)
        })
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.db.set_tx(None);
        if self.kind == LockKind::Exclusive {
            tracing::warn!("write transaction dropped without commit, rolling back");
            let conn = acquire_lock(&self.db.conn);
            if !conn.is_autocommit() {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    tracing::warn!(error = %e, "rollback failed");
                }
            }
        }
    }
}
