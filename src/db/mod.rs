//! Query Builders
//!
//! Identifier validation and SQL string builders for ClickHouse, PostgreSQL
//! and MySQL style placeholders. Builders only format strings; executing the
//! query is up to the caller's client.

mod proptest;
mod query;

pub use query::{
    build_batch_insert, build_insert_query, build_select_query, sanitize_identifier,
    BatchInsert, BatchParams, Dialect,
};
