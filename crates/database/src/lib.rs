//! Database backends for the muninn product catalogue.
//!
//! Two backends share one semantics: PostgreSQL (with PostGIS) and SQLite
//! (with an optionally loaded SpatiaLite extension). Query translation from
//! the analyzed expression tree to SQL lives in [`sql`]; everything
//! dialect-specific is behind [`sql::SqlDialect`].

pub mod backend;
pub mod postgres;
pub mod sql;
pub mod sqlite;

pub use backend::{DatabaseBackend, SearchQuery, SummaryQuery, SummaryResult};
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;
