//! Version-stepped schema migration.
//!
//! The engine walks [`steps::STEPS`] from the store's recorded version up to
//! [`CURRENT_VERSION`]. Each step commits on its own together with the new
//! version marker, so an interrupted upgrade resumes at the first step that
//! did not commit.
//!
//! Indexes and triggers are not patched step by step. Once the last step has
//! committed they are dropped and recreated from the current definitions.

mod helpers;
mod steps;

use super::database::{read_version, run_in_transaction};
use super::schema::{
    CURRENT_VERSION, OLDEST_SUPPORTED_VERSION, ensure_search_table, recreate_indexes,
    recreate_triggers,
};
use super::sqlite::db_error;
use crate::config::LegacyPolicy;
use crate::{Error, Result};
use rusqlite::Connection;
use std::time::Instant;
use steps::{STEPS, StepEffect};
use tracing::instrument;

/// Result of a completed migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Version the store was at before the first step.
    pub from_version: u32,
    /// Version recorded after the last step.
    pub final_version: u32,
    /// Number of steps applied.
    pub steps_applied: usize,
    /// True if an applied step changed the shape of the search index rows.
    pub rebuild_search_index: bool,
}

fn step_failed(version: u32, cause: &Error) -> Error {
    Error::MigrationFailed {
        version,
        cause: cause.to_string(),
    }
}

/// Upgrades the store on `conn` from version `from` to [`CURRENT_VERSION`].
///
/// The caller holds the exclusive lock and has no transaction open. A
/// scheduled search-index rebuild is reported in the outcome, not run here.
///
/// # Errors
///
/// - [`Error::LegacyVersion`] if `from` predates the oldest supported version
/// - [`Error::StoreTooNew`] if `from` is newer than this build
/// - [`Error::Usage`] if a transaction is open on `conn`
/// - [`Error::MigrationFailed`] naming the first step that failed
#[instrument(skip(conn, policy), fields(operation = "migrate", backend = "sqlite"))]
pub(crate) fn migrate(
    conn: &Connection,
    from: u32,
    policy: &LegacyPolicy,
) -> Result<MigrationOutcome> {
    if from < OLDEST_SUPPORTED_VERSION {
        return Err(Error::LegacyVersion {
            found: from,
            oldest_supported: OLDEST_SUPPORTED_VERSION,
        });
    }
    if from > CURRENT_VERSION {
        return Err(Error::StoreTooNew {
            found: from,
            supported: CURRENT_VERSION,
        });
    }
    if !conn.is_autocommit() {
        return Err(Error::Usage(
            "migration cannot run inside a transaction".to_string(),
        ));
    }

    // Table renames must leave foreign keys in sibling tables alone.
    conn.pragma_update(None, "legacy_alter_table", true)
        .map_err(|e| db_error("legacy_alter_table", e))?;
    let outcome = apply_steps(conn, from, policy);
    if let Err(e) = conn.pragma_update(None, "legacy_alter_table", false) {
        tracing::warn!(error = %e, "could not reset legacy_alter_table");
    }
    outcome
}

fn apply_steps(conn: &Connection, from: u32, policy: &LegacyPolicy) -> Result<MigrationOutcome> {
    let start = Instant::now();
    let mut outcome = MigrationOutcome {
        from_version: from,
        final_version: from,
        steps_applied: 0,
        rebuild_search_index: false,
    };
    tracing::info!(from, to = CURRENT_VERSION, "migrating catalogue schema");

    for step in STEPS.iter().filter(|s| s.version > from) {
        let step_start = Instant::now();
        let effect = run_in_transaction(conn, step.description, |conn| {
            let effect = (step.apply)(conn, policy)?;
            conn.pragma_update(None, "user_version", step.version)
                .map_err(|e| db_error("write_user_version", e))?;
            Ok(effect)
        })
        .map_err(|e| {
            metrics::counter!("migration_steps_failed_total").increment(1);
            tracing::error!(version = step.version, error = %e, "migration step failed");
            step_failed(step.version, &e)
        })?;

        let recorded = read_version(conn).map_err(|e| step_failed(step.version, &e))?;
        if recorded != step.version {
            return Err(Error::MigrationFailed {
                version: step.version,
                cause: format!("version marker reads {recorded} after commit"),
            });
        }

        outcome.final_version = recorded;
        outcome.steps_applied += 1;
        outcome.rebuild_search_index |= effect == StepEffect::RebuildSearchIndex;
        metrics::counter!("migration_steps_applied_total").increment(1);
        tracing::debug!(
            version = step.version,
            description = step.description,
            elapsed_ms = step_start.elapsed().as_millis(),
            "migration step applied"
        );
    }

    run_in_transaction(conn, "migration_finale", |conn| {
        recreate_indexes(conn);
        recreate_triggers(conn)?;
        ensure_search_table(conn)
    })
    .map_err(|e| step_failed(outcome.final_version, &e))?;

    tracing::info!(
        from,
        version = outcome.final_version,
        steps = outcome.steps_applied,
        rebuild_search_index = outcome.rebuild_search_index,
        elapsed_ms = start.elapsed().as_millis(),
        "catalogue schema migrated"
    );
    Ok(outcome)
}
