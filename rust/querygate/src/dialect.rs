//! SQL dialect selection for pagination and plan inspection.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Dialect used when rewriting statements. Always taken from configuration,
/// never detected from a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Postgres,
    MySql,
}

impl Dialect {
    /// Renders a trailing limit clause in this dialect's syntax.
    pub fn limit_clause(self, limit: i64, offset: i64) -> String {
        match self {
            Dialect::Postgres => format!("LIMIT {limit} OFFSET {offset}"),
            Dialect::MySql => format!("LIMIT {offset}, {limit}"),
        }
    }

    /// Wraps a statement in an `EXPLAIN` requesting JSON output.
    pub fn explain(self, sql: &str) -> String {
        match self {
            Dialect::Postgres => format!("EXPLAIN (FORMAT JSON) {sql}"),
            Dialect::MySql => format!("EXPLAIN FORMAT=JSON {sql}"),
        }
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            other => Err(format!("unsupported SQL dialect '{other}'")),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Postgres => f.write_str("postgres"),
            Dialect::MySql => f.write_str("mysql"),
        }
    }
}
