//! Per-caller access to the store.

use super::database::{CatalogueDb, Transaction};
use super::sqlite::{acquire_lock, timed};
use super::statements::StatementCache;
use super::sync::CancelToken;
use crate::Result;
use rusqlite::Connection;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// A caller's view of the store.
///
/// Every session owns its statement cache; the connection underneath is
/// shared with all other sessions. Blocking lock waits made by this
/// session observe its [`CancelToken`].
#[derive(Debug)]
pub struct Session<'a> {
    pub(crate) db: &'a CatalogueDb,
    statements: Mutex<StatementCache>,
    cancel: CancelToken,
}

impl<'a> Session<'a> {
    pub(crate) fn new(db: &'a CatalogueDb, capacity: NonZeroUsize) -> Self {
        Self {
            db,
            statements: Mutex::new(StatementCache::new(capacity)),
            cancel: CancelToken::new(),
        }
    }

    /// Returns a token that cancels this session's lock waits when fired.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Starts a read-write transaction on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Usage`] if the thread already has a
    /// transaction open, or [`crate::Error::Cancelled`].
    pub fn begin_write(&self) -> Result<Transaction<'a>> {
        self.db.begin_write(Some(&self.cancel))
    }

    /// Starts a read-only transaction on the calling thread.
    ///
    /// # Errors
    ///
    /// As for [`begin_write`](Self::begin_write).
    pub fn begin_read(&self) -> Result<Transaction<'a>> {
        self.db.begin_read(Some(&self.cancel))
    }

    /// Returns true if the calling thread has a transaction open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.db.in_transaction()
    }

    /// Number of statements currently cached by this session.
    #[must_use]
    pub fn cached_statements(&self) -> usize {
        acquire_lock(&self.statements).len()
    }

    /// Releases this session's compiled statements.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Cancelled`] if the lock wait is cancelled.
    pub fn clear_statements(&self) -> Result<()> {
        self.db.read("clear_statements", Some(&self.cancel), |conn| {
            acquire_lock(&self.statements).clear(conn);
            Ok(())
        })
    }

    /// Runs `f` under a shared lock with this session's statements.
    pub(crate) fn read<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&Connection, &mut StatementCache) -> Result<T>,
    ) -> Result<T> {
        timed(operation, || {
            self.db.read(operation, Some(&self.cancel), |conn| {
                f(conn, &mut acquire_lock(&self.statements))
            })
        })
    }

    /// Runs `f` inside a write transaction with this session's statements.
    pub(crate) fn write<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&Connection, &mut StatementCache) -> Result<T>,
    ) -> Result<T> {
        timed(operation, || {
            self.db.write(operation, Some(&self.cancel), |conn| {
                f(conn, &mut acquire_lock(&self.statements))
            })
        })
    }

    /// Runs `f` under the exclusive lock with no transaction open.
    pub(crate) fn exclusive<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        timed(operation, || {
            self.db
                .exclusive_outside_transaction(operation, Some(&self.cancel), f)
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::CatalogueDb;
    use crate::{Book, Error, StoreConfig};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_sessions_have_separate_caches() {
        let db = CatalogueDb::in_memory(StoreConfig::default()).unwrap();
        let first = db.session();
        let second = db.session();
        first.insert_book(&mut Book::new("Dune")).unwrap();
        assert!(first.cached_statements() > 0);
        assert_eq!(second.cached_statements(), 0);

        first.clear_statements().unwrap();
        assert_eq!(first.cached_statements(), 0);
        assert_eq!(second.book_count().unwrap(), 1);

        let kept = second.cached_statements();
        first.clear_statements().unwrap();
        assert_eq!(second.cached_statements(), kept);
        assert_eq!(second.book_count().unwrap(), 1);
        first.insert_book(&mut Book::new("Emma")).unwrap();
        assert_eq!(first.book_count().unwrap(), 2);
    }

    #[test]
    fn test_cancelled_session_wait() {
        let db = Arc::new(CatalogueDb::in_memory(StoreConfig::default()).unwrap());
        let writer = db.session();
        let tx = writer.begin_write().unwrap();

        let reader_db = Arc::clone(&db);
        let (token_tx, token_rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let session = reader_db.session();
            token_tx.send(session.cancel_token()).unwrap();
            session.book_count()
        });

        let token = token_rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));
        token.cancel();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled { .. })));
        tx.commit().unwrap();
    }
}
