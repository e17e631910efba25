//! Dry-run plan inspection.
//!
//! Asks the database to explain a validated statement and turns the plan into
//! cost estimates plus heuristic warnings. Failures never propagate: an
//! unexplainable statement yields `is_valid = false`.

use crate::{
    db::Database,
    dialect::Dialect,
    error::truncate_statement,
    models::{EstimatedCost, ExplainResult},
    pagination::strip_trailing_semicolons,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub const INVALID_PLAN_WARNING: &str = "Query could not be explained; the statement may be invalid";

const LARGE_ROW_ESTIMATE: f64 = 10_000.0;
const HIGH_COST: f64 = 100_000.0;

#[derive(Clone)]
pub struct PlanAnalyzer {
    db: Arc<dyn Database>,
    dialect: Dialect,
}

impl PlanAnalyzer {
    pub fn new(db: Arc<dyn Database>, dialect: Dialect) -> Self {
        Self { db, dialect }
    }

    pub async fn explain(&self, sql: &str) -> ExplainResult {
        let statement = self.dialect.explain(strip_trailing_semicolons(sql));

        let plan = match self.db.query(&statement).await {
            Ok(result) => result.rows.first().and_then(first_column).map(parse_embedded_json),
            Err(err) => {
                warn!(
                    error = %err,
                    statement = %truncate_statement(&statement),
                    "explain failed"
                );
                return invalid_plan();
            }
        };

        let Some(plan) = plan else {
            warn!(statement = %truncate_statement(&statement), "explain returned no plan");
            return invalid_plan();
        };

        let estimated_cost = extract_cost(&plan);
        let warnings = plan_warnings(&plan, &estimated_cost);
        debug!(?estimated_cost, warnings = warnings.len(), "explain completed");

        ExplainResult {
            explain_plan: plan,
            is_valid: true,
            estimated_cost,
            warnings,
        }
    }
}

fn invalid_plan() -> ExplainResult {
    ExplainResult {
        explain_plan: Value::Null,
        is_valid: false,
        estimated_cost: EstimatedCost::default(),
        warnings: vec![INVALID_PLAN_WARNING.to_string()],
    }
}

fn first_column(row: &Value) -> Option<Value> {
    match row {
        Value::Object(columns) => columns.values().next().cloned(),
        Value::Null => None,
        other => Some(other.clone()),
    }
}

/// MySQL returns the JSON plan as text.
fn parse_embedded_json(value: Value) -> Value {
    match value {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

fn plan_root(plan: &Value) -> &Value {
    match plan {
        Value::Array(items) => items.first().unwrap_or(plan),
        _ => plan,
    }
}

fn as_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

fn extract_cost(plan: &Value) -> EstimatedCost {
    let root = plan_root(plan);

    if let Some(node) = root.get("Plan") {
        return EstimatedCost {
            startup_cost: as_number(node.get("Startup Cost")),
            total_cost: as_number(node.get("Total Cost")),
            estimated_rows: as_number(node.get("Plan Rows")),
        };
    }

    if let Some(block) = root.get("query_block") {
        let table = block.get("table");
        return EstimatedCost {
            startup_cost: None,
            total_cost: as_number(block.get("cost_info").and_then(|info| info.get("query_cost"))),
            estimated_rows: as_number(table.and_then(|t| t.get("rows_produced_per_join")))
                .or_else(|| as_number(table.and_then(|t| t.get("rows_examined_per_scan")))),
        };
    }

    EstimatedCost::default()
}

fn plan_warnings(plan: &Value, cost: &EstimatedCost) -> Vec<String> {
    let text = plan.to_string();
    let lower = text.to_lowercase();
    let mut warnings = Vec::new();

    if text.contains("Seq Scan") || text.contains(r#""access_type":"ALL""#) {
        warnings.push(
            "Full table scan detected; consider adding an index on the filtered columns".to_string(),
        );
    }

    let large_estimate = cost
        .estimated_rows
        .map(|rows| rows > LARGE_ROW_ESTIMATE)
        .unwrap_or(false);
    if (text.contains("Nested Loop") || text.contains("nested_loop")) && large_estimate {
        warnings.push("Nested loop join over a large row estimate; the join may be slow".to_string());
    }

    if lower.contains("external merge")
        || text.contains(r#""Sort Space Type":"Disk""#)
        || text.contains(r#""using_filesort":true"#)
        || text.contains(r#""using_temporary_table":true"#)
    {
        warnings.push("Sort may spill to disk; consider an index that supports the ORDER BY".to_string());
    }

    if let Some(total) = cost.total_cost.filter(|total| *total > HIGH_COST) {
        warnings.push(format!("High estimated cost ({total:.0}); the query may be slow"));
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::FakeDatabase;
    use serde_json::json;

    fn pg_plan(node_type: &str, rows: f64, total: f64) -> Value {
        json!([{
            "Plan": {
                "Node Type": node_type,
                "Startup Cost": 0.0,
                "Total Cost": total,
                "Plan Rows": rows,
                "Plans": [{ "Node Type": "Seq Scan", "Relation Name": "orders" }]
            }
        }])
    }

    #[tokio::test]
    async fn extracts_postgres_costs_and_warnings() {
        let db = Arc::new(FakeDatabase {
            explain_plan: Some(pg_plan("Nested Loop", 50_000.0, 250_000.0)),
            ..FakeDatabase::default()
        });
        let analyzer = PlanAnalyzer::new(db.clone(), Dialect::Postgres);

        let result = analyzer.explain("SELECT * FROM orders;").await;

        assert!(result.is_valid);
        assert_eq!(
            result.estimated_cost,
            EstimatedCost {
                startup_cost: Some(0.0),
                total_cost: Some(250_000.0),
                estimated_rows: Some(50_000.0),
            }
        );
        assert_eq!(result.warnings.len(), 3, "warnings: {:?}", result.warnings);
        assert!(result.warnings[0].starts_with("Full table scan"));
        assert!(result.warnings[1].starts_with("Nested loop"));
        assert!(result.warnings[2].starts_with("High estimated cost"));
        assert_eq!(
            db.statements(),
            vec!["EXPLAIN (FORMAT JSON) SELECT * FROM orders".to_string()]
        );
    }

    #[tokio::test]
    async fn cheap_plans_have_no_warnings() {
        let db = Arc::new(FakeDatabase {
            explain_plan: Some(json!([{
                "Plan": { "Node Type": "Result", "Startup Cost": 0.0, "Total Cost": 0.01, "Plan Rows": 1 }
            }])),
            ..FakeDatabase::default()
        });
        let analyzer = PlanAnalyzer::new(db, Dialect::Postgres);

        let result = analyzer.explain("SELECT 1").await;

        assert!(result.is_valid);
        assert!(result.warnings.is_empty());
        assert_eq!(result.estimated_cost.estimated_rows, Some(1.0));
    }

    #[tokio::test]
    async fn parses_mysql_query_block_text() {
        let plan_text = json!({
            "query_block": {
                "cost_info": { "query_cost": "1234.50" },
                "ordering_operation": { "using_filesort": true },
                "table": {
                    "table_name": "orders",
                    "access_type": "ALL",
                    "rows_examined_per_scan": 9000,
                    "rows_produced_per_join": 900
                }
            }
        })
        .to_string();
        let db = Arc::new(FakeDatabase {
            explain_plan: Some(Value::String(plan_text)),
            ..FakeDatabase::default()
        });
        let analyzer = PlanAnalyzer::new(db.clone(), Dialect::MySql);

        let result = analyzer.explain("SELECT * FROM orders ORDER BY created_at").await;

        assert!(result.is_valid);
        assert_eq!(result.estimated_cost.startup_cost, None);
        assert_eq!(result.estimated_cost.total_cost, Some(1234.5));
        assert_eq!(result.estimated_cost.estimated_rows, Some(900.0));
        assert!(result.explain_plan.get("query_block").is_some());
        assert_eq!(result.warnings.len(), 2, "warnings: {:?}", result.warnings);
        assert_eq!(
            db.statements(),
            vec!["EXPLAIN FORMAT=JSON SELECT * FROM orders ORDER BY created_at".to_string()]
        );
    }

    #[tokio::test]
    async fn database_rejection_becomes_invalid_result() {
        let db = Arc::new(FakeDatabase::default());
        let analyzer = PlanAnalyzer::new(db, Dialect::Postgres);

        let result = analyzer.explain("SELECT FROM").await;

        assert!(!result.is_valid);
        assert_eq!(result.explain_plan, Value::Null);
        assert_eq!(result.estimated_cost, EstimatedCost::default());
        assert_eq!(result.warnings, vec![INVALID_PLAN_WARNING.to_string()]);
    }

    #[test]
    fn unknown_plan_shapes_have_no_costs() {
        assert_eq!(extract_cost(&json!({ "other": 1 })), EstimatedCost::default());
        assert_eq!(extract_cost(&json!([])), EstimatedCost::default());
    }
}
