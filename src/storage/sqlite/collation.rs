//! The `LOCALIZED` collation and the fold used for search text.
//!
//! Both work on the canonical decomposition of the input: accents become
//! combining marks, which are dropped, so "Émile" and "emile" compare equal.

use crate::{Error, Result};
use rusqlite::Connection;
use std::cmp::Ordering;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Name under which the collation is registered on every connection.
pub const LOCALIZED: &str = "LOCALIZED";

/// Returns the comparison key for `s`: decomposed, marks removed, lower-cased.
#[must_use]
pub fn collation_key(s: &str) -> String {
    s.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Case- and accent-insensitive comparison, as registered with `SQLite`.
///
/// Strings with equal keys compare equal, which is what identity lookups need.
#[must_use]
pub fn compare_localized(a: &str, b: &str) -> Ordering {
    collation_key(a).cmp(&collation_key(b))
}

/// Key comparison with a byte-wise tie break, for in-memory sorting.
#[must_use]
pub fn compare_localized_total(a: &str, b: &str) -> Ordering {
    compare_localized(a, b).then_with(|| a.cmp(b))
}

/// Scripts written without spaces between words. Each of their characters
/// is indexed as a token of its own.
fn is_unspaced_script(c: char) -> bool {
    matches!(
        u32::from(c),
        0x3040..=0x30FF        // Hiragana, Katakana
            | 0x31F0..=0x31FF  // Katakana phonetic extensions
            | 0x3400..=0x4DBF  // CJK extension A
            | 0x4E00..=0x9FFF  // CJK unified ideographs
            | 0xF900..=0xFAFF  // CJK compatibility ideographs
            | 0xFF66..=0xFF9F  // Half-width Katakana
            | 0x20000..=0x2FA1F
    )
}

/// Folds text for the search index with the same rules as
/// [`collation_key`]: accents are stripped and everything is lower-cased,
/// in every script. Characters of scripts written without word spaces are
/// set apart by spaces so each one is a searchable token.
#[must_use]
pub fn fold_for_search(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in collation_key(s).chars() {
        if is_unspaced_script(c) {
            if !out.is_empty() && !out.ends_with(|p: char| p.is_whitespace() || p == '-') {
                out.push(' ');
            }
            out.push(c);
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    out
}

/// Registers [`LOCALIZED`] on `conn`.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the engine rejects the collation.
pub fn register_collations(conn: &Connection) -> Result<()> {
    conn.create_collation(LOCALIZED, compare_localized)
        .map_err(|e| Error::OperationFailed {
            operation: "register_collation".to_string(),
            cause: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("Smith", "smith" ; "ascii case")]
    #[test_case("Émile", "emile" ; "accented capital")]
    #[test_case("Brontë", "BRONTE" ; "diaeresis")]
    #[test_case("Łódź", "Łódź" ; "identical")]
    fn test_localized_equal(a: &str, b: &str) {
        assert_eq!(compare_localized(a, b), Ordering::Equal);
    }

    #[test]
    fn test_localized_orders_ignoring_case() {
        assert_eq!(compare_localized("apple", "Banana"), Ordering::Less);
        assert_eq!(compare_localized("Zola", "éluard"), Ordering::Greater);
    }

    #[test]
    fn test_total_ordering_breaks_ties() {
        assert_ne!(compare_localized_total("Smith", "smith"), Ordering::Equal);
    }

    #[test]
    fn test_fold_for_search() {
        assert_eq!(fold_for_search("Émile Zola"), "emile zola");
        assert_eq!(fold_for_search("DUNE; 1"), "dune; 1");
        assert_eq!(fold_for_search("naïve café"), "naive cafe");
    }

    #[test]
    fn test_fold_keeps_non_latin_scripts() {
        assert_eq!(fold_for_search("Война и Мир"), "воина и мир");
        assert_eq!(fold_for_search("ノルウェイの森"), "ノ ル ウ ェ イ の 森 ");
        assert_eq!(fold_for_search("-森林"), "-森 林 ");
    }

    #[test]
    fn test_registered_collation_used_in_sql() {
        let conn = Connection::open_in_memory().unwrap();
        register_collations(&conn).unwrap();
        conn.execute_batch(
            "CREATE TABLE t (name TEXT);
             INSERT INTO t VALUES ('Émile');",
        )
        .unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM t WHERE name = 'EMILE' COLLATE LOCALIZED",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
