//! Data models for the catalogue.
//!
//! Typed DTOs for every entity the store persists, plus the coercion step
//! that turns loose text into column values.

mod book;
mod entity;
pub mod field;

pub use book::{BOOK_COLUMNS, Book};
pub use entity::{Author, Bookshelf, Series, TocEntry, UNSAVED_ID};
pub use field::{ColumnDef, ColumnType, FieldValue, coerce};
