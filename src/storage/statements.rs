//! Per-session prepared statement cache.
//!
//! Statements are keyed by a caller-chosen logical name rather than by SQL
//! text. The compiled form lives in the connection's own statement cache
//! (`prepare_cached`). Each cache tags its SQL with a scope comment, so two
//! sessions never share a compiled statement and clearing one session
//! leaves the others alone. This cache tracks which names the session has
//! registered, bounds them with an LRU and hands out [`StatementHandle`]s.
//!
//! A handle only offers "bind every parameter, then run". Bindings are
//! cleared when the compiled statement goes back to the connection, so no
//! call ever observes values bound by another.

use super::sqlite::db_error;
use crate::{Error, Result};
use lru::LruCache;
use rusqlite::{Connection, OptionalExtension, Row, ToSql};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

/// A named, validated statement.
#[derive(Debug, Clone)]
pub struct StatementHandle {
    name: &'static str,
    sql: Arc<str>,
    param_count: usize,
}

impl StatementHandle {
    /// Logical name of the statement.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The SQL compiled for this handle, scope tag included.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Number of parameters every call must bind.
    #[must_use]
    pub const fn param_count(&self) -> usize {
        self.param_count
    }

    /// Drops the compiled statement from the connection's cache.
    fn discard(&self, conn: &Connection) {
        if let Ok(stmt) = conn.prepare_cached(&self.sql) {
            stmt.discard();
        }
    }

    fn check_params(&self, params: &[&dyn ToSql]) -> Result<()> {
        if params.len() == self.param_count {
            Ok(())
        } else {
            Err(Error::Usage(format!(
                "statement '{}' takes {} parameters, {} bound",
                self.name,
                self.param_count,
                params.len()
            )))
        }
    }

    /// Binds `params` and executes, returning the number of changed rows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Usage`] on a parameter count mismatch, or the mapped
    /// engine error.
    pub fn execute(&self, conn: &Connection, params: &[&dyn ToSql]) -> Result<usize> {
        self.check_params(params)?;
        let mut stmt = conn
            .prepare_cached(&self.sql)
            .map_err(|e| db_error(self.name, e))?;
        stmt.execute(params).map_err(|e| db_error(self.name, e))
    }

    /// Binds `params` and executes an INSERT, returning the new row id.
    ///
    /// # Errors
    ///
    /// As for [`execute`](Self::execute).
    pub fn insert(&self, conn: &Connection, params: &[&dyn ToSql]) -> Result<i64> {
        self.check_params(params)?;
        let mut stmt = conn
            .prepare_cached(&self.sql)
            .map_err(|e| db_error(self.name, e))?;
        stmt.insert(params).map_err(|e| db_error(self.name, e))
    }

    /// Binds `params` and maps the first row, if any.
    ///
    /// # Errors
    ///
    /// As for [`execute`](Self::execute).
    pub fn query_row<T, F>(&self, conn: &Connection, params: &[&dyn ToSql], f: F) -> Result<Option<T>>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.check_params(params)?;
        let mut stmt = conn
            .prepare_cached(&self.sql)
            .map_err(|e| db_error(self.name, e))?;
        stmt.query_row(params, f)
            .optional()
            .map_err(|e| db_error(self.name, e))
    }

    /// Binds `params` and maps every row.
    ///
    /// # Errors
    ///
    /// As for [`execute`](Self::execute).
    pub fn query_map<T, F>(&self, conn: &Connection, params: &[&dyn ToSql], f: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.check_params(params)?;
        let mut stmt = conn
            .prepare_cached(&self.sql)
            .map_err(|e| db_error(self.name, e))?;
        let rows = stmt
            .query_map(params, f)
            .map_err(|e| db_error(self.name, e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_error(self.name, e))
    }
}

/// Bounded name-to-statement cache owned by one session.
#[derive(Debug)]
pub struct StatementCache {
    entries: LruCache<&'static str, StatementHandle>,
    scope: u64,
}

impl StatementCache {
    /// Creates a cache holding at most `capacity` statements.
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            scope: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Returns the statement registered under `name`.
    pub fn get(&mut self, name: &str) -> Option<StatementHandle> {
        self.entries.get(name).cloned()
    }

    /// Compiles `sql` and registers it under `name`, replacing any previous
    /// statement with that name. The least recently used entry is evicted
    /// when the cache is full.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error if `sql` does not compile.
    pub fn add(&mut self, conn: &Connection, name: &'static str, sql: &str) -> Result<StatementHandle> {
        let scoped = format!("/* scope {} */ {sql}", self.scope);
        let param_count = conn
            .prepare_cached(&scoped)
            .map_err(|e| db_error(name, e))?
            .parameter_count();
        let handle = StatementHandle {
            name,
            sql: Arc::from(scoped),
            param_count,
        };
        if let Some((evicted, old)) = self.entries.push(name, handle.clone()) {
            if old.sql != handle.sql {
                old.discard(conn);
            }
            if evicted != name {
                metrics::counter!("statement_cache_evictions_total").increment(1);
                tracing::trace!(evicted, "statement evicted from session cache");
            }
        }
        Ok(handle)
    }

    /// Returns the statement under `name`, compiling `sql` on first use.
    ///
    /// # Errors
    ///
    /// Returns the mapped engine error if `sql` does not compile.
    pub fn get_or_add(
        &mut self,
        conn: &Connection,
        name: &'static str,
        sql: &str,
    ) -> Result<StatementHandle> {
        match self.get(name) {
            Some(handle) => Ok(handle),
            None => self.add(conn, name, sql),
        }
    }

    /// Releases this cache's compiled statements and empties it. Statements
    /// compiled by other caches on the same connection are untouched.
    pub fn clear(&mut self, conn: &Connection) {
        for (_, handle) in self.entries.iter() {
            handle.discard(conn);
        }
        self.entries.clear();
    }

    /// Number of registered statements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of registered statements.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}
