//! Table-reshaping primitives shared by the migration steps.

use crate::Result;
use crate::storage::schema::{has_column, table_columns, table_exists};
use crate::storage::sqlite::db_error;
use rusqlite::Connection;

/// Name the original table is parked under while it is rebuilt.
const RECREATE_TMP: &str = "recreate_tmp";

/// Runs one or more statements, mapping failures to `operation`.
pub(super) fn exec(conn: &Connection, operation: &str, sql: &str) -> Result<()> {
    conn.execute_batch(sql).map_err(|e| db_error(operation, e))
}

/// Adds `column` to `table` unless it is already there.
///
/// Returns true if the column was added.
pub(super) fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<bool> {
    if has_column(conn, table, column)? {
        return Ok(false);
    }
    exec(
        conn,
        "add_column",
        &format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"),
    )?;
    Ok(true)
}

/// Copies rows from `from` into `to`, matching columns by name.
///
/// Only columns present in both tables are copied, minus `skip`. Columns
/// that exist only in `to` keep their defaults.
pub(super) fn copy_table_safely(
    conn: &Connection,
    from: &str,
    to: &str,
    skip: &[&str],
) -> Result<usize> {
    let target = table_columns(conn, to)?;
    let shared: Vec<String> = table_columns(conn, from)?
        .into_iter()
        .filter(|c| target.iter().any(|t| t.eq_ignore_ascii_case(c)))
        .filter(|c| !skip.iter().any(|s| s.eq_ignore_ascii_case(c)))
        .collect();
    if shared.is_empty() {
        return Ok(0);
    }
    let list = shared.join(", ");
    conn.execute(
        &format!("INSERT INTO {to} ({list}) SELECT {list} FROM {from}"),
        [],
    )
    .map_err(|e| db_error("copy_table", e))
}

/// Rebuilds `table` with `create_sql`, keeping every row.
///
/// The original is renamed aside, the new shape created, matching columns
/// copied over (minus `skip`) and the original dropped. Row ids survive.
pub(super) fn recreate_and_reload(
    conn: &Connection,
    table: &str,
    create_sql: &str,
    skip: &[&str],
) -> Result<usize> {
    exec(
        conn,
        "recreate_table",
        &format!(
            "DROP TABLE IF EXISTS {RECREATE_TMP};
             ALTER TABLE {table} RENAME TO {RECREATE_TMP};"
        ),
    )?;
    exec(conn, "recreate_table", create_sql)?;
    let copied = copy_table_safely(conn, RECREATE_TMP, table, skip)?;
    exec(conn, "recreate_table", &format!("DROP TABLE {RECREATE_TMP}"))?;
    tracing::debug!(table, rows = copied, "table rebuilt");
    Ok(copied)
}

/// One column as reported by `PRAGMA table_info`.
struct ColumnSpec {
    name: String,
    decl_type: String,
    not_null: bool,
    default: Option<String>,
    key_rank: i64,
}

impl ColumnSpec {
    fn definition(&self, sole_integer_key: bool) -> String {
        let mut out = format!("{} {}", self.name, self.decl_type);
        if sole_integer_key && self.key_rank > 0 {
            out.push_str(" primary key autoincrement");
            return out;
        }
        if self.not_null {
            out.push_str(" not null");
        }
        if let Some(default) = &self.default {
            out.push_str(" default (");
            out.push_str(default);
            out.push(')');
        }
        out
    }
}

fn column_specs(conn: &Connection, table: &str) -> Result<Vec<ColumnSpec>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info(\"{table}\")"))
        .map_err(|e| db_error("table_info", e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ColumnSpec {
                name: row.get(1)?,
                decl_type: row.get(2)?,
                not_null: row.get(3)?,
                default: row.get(4)?,
                key_rank: row.get(5)?,
            })
        })
        .map_err(|e| db_error("table_info", e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| db_error("table_info", e))
}

/// Rebuilds `table` without the named columns.
///
/// The new shape is derived from the table's current column list. Foreign
/// key clauses are not carried over; later steps rebuild the affected tables
/// from their full definitions. A no-op when none of `drop` exist.
pub(super) fn drop_columns(conn: &Connection, table: &str, drop: &[&str]) -> Result<()> {
    let columns = column_specs(conn, table)?;
    if !columns
        .iter()
        .any(|c| drop.iter().any(|d| d.eq_ignore_ascii_case(&c.name)))
    {
        return Ok(());
    }

    let keys: Vec<&ColumnSpec> = columns.iter().filter(|c| c.key_rank > 0).collect();
    let sole_integer_key =
        keys.len() == 1 && keys.first().is_some_and(|k| k.decl_type.eq_ignore_ascii_case("integer"));

    let mut parts: Vec<String> = columns
        .iter()
        .filter(|c| !drop.iter().any(|d| d.eq_ignore_ascii_case(&c.name)))
        .map(|c| c.definition(sole_integer_key))
        .collect();
    if !sole_integer_key && !keys.is_empty() {
        let mut keys = keys;
        keys.sort_by_key(|k| k.key_rank);
        let names: Vec<&str> = keys.iter().map(|k| k.name.as_str()).collect();
        parts.push(format!("primary key ({})", names.join(", ")));
    }

    let create_sql = format!("CREATE TABLE {table} ({})", parts.join(", "));
    recreate_and_reload(conn, table, &create_sql, drop)?;
    Ok(())
}

/// Creates `table` from `ddl` if it is missing. Returns true if created.
pub(super) fn create_if_missing(conn: &Connection, table: &str, ddl: &str) -> Result<bool> {
    if table_exists(conn, table)? {
        return Ok(false);
    }
    exec(conn, "create_table", ddl)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE things (
                 _id integer primary key autoincrement,
                 name text not null,
                 legacy integer,
                 flag boolean not null default 'f'
             );
             INSERT INTO things (_id, name, legacy) VALUES (3, 'a', 1), (9, 'b', 2);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_add_column_if_missing() {
        let conn = conn();
        assert!(add_column_if_missing(&conn, "things", "notes", "text").unwrap());
        assert!(!add_column_if_missing(&conn, "things", "NOTES", "text").unwrap());
        assert!(has_column(&conn, "things", "notes").unwrap());
    }

    #[test]
    fn test_recreate_keeps_rows_and_ids() {
        let conn = conn();
        let copied = recreate_and_reload(
            &conn,
            "things",
            "CREATE TABLE things (_id integer primary key autoincrement,
                                  name text not null, extra text default 'x')",
            &[],
        )
        .unwrap();
        assert_eq!(copied, 2);
        let rows: Vec<(i64, String, String)> = conn
            .prepare("SELECT _id, name, extra FROM things ORDER BY _id")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(
            rows,
            vec![
                (3, "a".to_string(), "x".to_string()),
                (9, "b".to_string(), "x".to_string())
            ]
        );
        assert!(!table_exists(&conn, RECREATE_TMP).unwrap());
    }

    #[test]
    fn test_drop_columns() {
        let conn = conn();
        drop_columns(&conn, "things", &["legacy"]).unwrap();
        assert_eq!(table_columns(&conn, "things").unwrap(), vec!["_id", "name", "flag"]);
        let flag: String = conn
            .query_row("SELECT flag FROM things WHERE _id = 3", [], |r| r.get(0))
            .unwrap();
        assert_eq!(flag, "f");

        // Autoincrement survives the rebuild.
        conn.execute("INSERT INTO things (name) VALUES ('c')", []).unwrap();
        assert_eq!(conn.last_insert_rowid(), 10);
    }

    #[test]
    fn test_drop_missing_column_is_noop() {
        let conn = conn();
        drop_columns(&conn, "things", &["nope"]).unwrap();
        assert_eq!(table_columns(&conn, "things").unwrap().len(), 4);
    }
}
