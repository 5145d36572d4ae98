//! Persistence: relational state in SQLite, bars in DuckDB

pub mod duckdb;
pub mod sqlite;
