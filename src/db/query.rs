//! SQL string builders

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// SQL dialect, which decides the placeholder style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// Named `%(column)s` placeholders
    #[default]
    ClickHouse,
    /// Positional `%s` placeholders
    Postgres,
    /// Positional `%s` placeholders
    MySql,
}

impl Dialect {
    fn placeholder(&self, column: &str) -> String {
        match self {
            Dialect::ClickHouse => format!("%({})s", column),
            Dialect::Postgres | Dialect::MySql => "%s".to_string(),
        }
    }
}

impl FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "clickhouse" => Ok(Dialect::ClickHouse),
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "mysql" => Ok(Dialect::MySql),
            _ => Err(Error::UnsupportedDialect(s.to_string())),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::ClickHouse => write!(f, "clickhouse"),
            Dialect::Postgres => write!(f, "postgres"),
            Dialect::MySql => write!(f, "mysql"),
        }
    }
}

/// Accept `[A-Za-z_][A-Za-z0-9_]*`, reject anything else.
pub fn sanitize_identifier(identifier: &str) -> Result<&str> {
    let mut chars = identifier.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');

    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(identifier)
    } else {
        Err(Error::InvalidIdentifier(identifier.to_string()))
    }
}

fn sanitize_all<'a>(identifiers: &[&'a str]) -> Result<Vec<&'a str>> {
    identifiers.iter().map(|id| sanitize_identifier(id)).collect()
}

/// `INSERT INTO table (a, b) VALUES (<placeholders>)`
pub fn build_insert_query(table: &str, columns: &[&str], dialect: Dialect) -> Result<String> {
    sanitize_identifier(table)?;
    if columns.is_empty() {
        return Err(Error::EmptyInput(format!("no columns to insert into {}", table)));
    }
    let columns = sanitize_all(columns)?;

    let values: Vec<String> = columns.iter().map(|c| dialect.placeholder(c)).collect();
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        values.join(", ")
    ))
}

/// `SELECT` with optional equality filters, ordering and limit.
///
/// An empty `columns` slice selects `*`; a limit of zero is ignored.
pub fn build_select_query(
    table: &str,
    columns: &[&str],
    filters: &[&str],
    order_by: Option<&str>,
    limit: Option<u64>,
    dialect: Dialect,
) -> Result<String> {
    sanitize_identifier(table)?;

    let selected = if columns.is_empty() {
        "*".to_string()
    } else {
        sanitize_all(columns)?.join(", ")
    };
    let mut query = format!("SELECT {} FROM {}", selected, table);

    if !filters.is_empty() {
        let conditions: Vec<String> = sanitize_all(filters)?
            .into_iter()
            .map(|col| format!("{} = {}", col, dialect.placeholder(col)))
            .collect();
        query.push_str(" WHERE ");
        query.push_str(&conditions.join(" AND "));
    }

    if let Some(column) = order_by {
        query.push_str(" ORDER BY ");
        query.push_str(sanitize_identifier(column)?);
    }

    if let Some(limit) = limit.filter(|&n| n > 0) {
        query.push_str(&format!(" LIMIT {}", limit));
    }

    Ok(query)
}

/// Parameters accompanying a batch insert
#[derive(Debug, Clone, PartialEq)]
pub enum BatchParams {
    /// Whole records, for clients that bind by column name
    Records(Vec<Map<String, Value>>),
    /// One positional row per record, in column order
    Rows(Vec<Vec<Value>>),
}

/// Batch insert statement and its parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BatchInsert {
    pub query: String,
    pub columns: Vec<String>,
    pub params: BatchParams,
}

/// Build a batch insert for `records`. Columns come from the first record,
/// in its key insertion order; returns `None` when there is nothing to insert.
pub fn build_batch_insert(
    table: &str,
    records: &[Map<String, Value>],
    dialect: Dialect,
) -> Result<Option<BatchInsert>> {
    let Some(first) = records.first() else {
        return Ok(None);
    };

    sanitize_identifier(table)?;
    let columns: Vec<String> = first.keys().cloned().collect();
    if columns.is_empty() {
        return Err(Error::EmptyInput(format!("first record for {} has no columns", table)));
    }
    for column in &columns {
        sanitize_identifier(column)?;
    }
    let column_list = columns.join(", ");

    let (query, params) = match dialect {
        Dialect::ClickHouse => (
            format!("INSERT INTO {} ({}) VALUES", table, column_list),
            BatchParams::Records(records.to_vec()),
        ),
        Dialect::Postgres | Dialect::MySql => {
            let placeholders = vec!["%s"; columns.len()].join(", ");
            let rows = records
                .iter()
                .enumerate()
                .map(|(index, record)| {
                    columns
                        .iter()
                        .map(|column| {
                            record.get(column).cloned().ok_or_else(|| {
                                Error::EmptyInput(format!(
                                    "record {} is missing column '{}'",
                                    index, column
                                ))
                            })
                        })
                        .collect::<Result<Vec<Value>>>()
                })
                .collect::<Result<Vec<_>>>()?;
            (
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table, column_list, placeholders
                ),
                BatchParams::Rows(rows),
            )
        }
    };

    Ok(Some(BatchInsert {
        query,
        columns,
        params,
    }))
}

// =============================================================================
// Tests
// =============================================================================
