//! Shared `SQLite` infrastructure.
//!
//! ## Module Structure
//!
//! - [`connection`]: opening, configuring and locking the shared connection
//! - [`collation`]: the `LOCALIZED` collation and search-text folding
//! - [`error`]: engine error classification
//! - [`metrics`]: shared metrics recording helpers

mod collation;
mod connection;
mod error;
mod metrics;

pub use collation::{
    LOCALIZED, collation_key, compare_localized, compare_localized_total, fold_for_search,
    register_collations,
};
pub use connection::{acquire_lock, configure_connection, open_connection, open_read_only};
pub use error::db_error;
pub use metrics::{BACKEND, record_operation_metrics, timed};
