//! Mapping of engine errors onto [`crate::Error`].

use crate::Error;
use rusqlite::ErrorCode;

/// Converts an engine error, labelled with the failing operation.
///
/// Constraint failures become [`Error::ConstraintViolation`] so callers can
/// tell an aborted write from an I/O failure.
pub fn db_error(operation: &str, e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            Error::ConstraintViolation {
                operation: operation.to_string(),
                cause: e.to_string(),
            }
        },
        _ => Error::OperationFailed {
            operation: operation.to_string(),
            cause: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_constraint_is_classified() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")
            .unwrap();
        let err = conn
            .execute("INSERT INTO t VALUES (1)", [])
            .map_err(|e| db_error("insert_t", e))
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation { ref operation, .. } if operation == "insert_t"));
    }

    #[test]
    fn test_other_errors_are_operation_failed() {
        let conn = Connection::open_in_memory().unwrap();
        let err = conn
            .execute("SELECT * FROM missing", [])
            .map_err(|e| db_error("select_missing", e))
            .unwrap_err();
        assert!(matches!(err, Error::OperationFailed { .. }));
    }
}
