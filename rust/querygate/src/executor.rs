use crate::{
    db::{Database, DbRows},
    error::{truncate_statement, Result, ServiceError},
    models::{FieldMeta, QueryResult, ResultMetadata},
    pagination::{PaginatedSql, PaginationSpec},
};
use serde_json::Value;
use std::{sync::Arc, time::Instant};
use tracing::{debug, warn};

/// Runs a paginated statement and its count statement against the database.
#[derive(Clone)]
pub struct QueryExecutor {
    db: Arc<dyn Database>,
}

impl QueryExecutor {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Fails only when the paginated statement fails. A failed count degrades
    /// to `total_rows = 0`.
    pub async fn execute(&self, statements: &PaginatedSql, spec: &PaginationSpec) -> Result<QueryResult> {
        let page = async {
            let started = Instant::now();
            let outcome = self.db.query(&statements.sql).await;
            (outcome, started.elapsed())
        };
        let ((outcome, elapsed), total_rows) = tokio::join!(page, self.count(&statements.count_sql));

        let DbRows { rows, fields } =
            outcome.map_err(|err| ServiceError::execution(&err, &statements.sql))?;
        let execution_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        debug!(
            rows = rows.len(),
            total_rows,
            execution_time_ms,
            "paginated query completed"
        );

        Ok(QueryResult {
            metadata: ResultMetadata {
                execution_time_ms,
                row_count: rows.len(),
                fields: fields
                    .into_iter()
                    .map(|field| FieldMeta {
                        name: field.name,
                        field_type: field.type_name,
                    })
                    .collect(),
            },
            pagination: spec.meta(total_rows),
            rows,
            from_cache: false,
        })
    }

    async fn count(&self, count_sql: &str) -> i64 {
        match self.db.query(count_sql).await {
            Ok(result) => match result.rows.first().and_then(extract_total) {
                Some(total) => total,
                None => {
                    warn!(statement = %truncate_statement(count_sql), "count query returned no usable total");
                    0
                }
            },
            Err(err) => {
                warn!(
                    error = %err,
                    statement = %truncate_statement(count_sql),
                    "count query failed; reporting zero total rows"
                );
                0
            }
        }
    }
}

fn extract_total(row: &Value) -> Option<i64> {
    match row.get("total_count")? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}
