use async_trait::async_trait;
use axum::{
    body::{self, Body},
    Router,
};
use http::{Request, StatusCode};
use parking_lot::Mutex;
use querygate::{
    cache::{CacheMetrics, CacheSettings, MemoryStore, QueryCache},
    config::AppConfig,
    db::{Database, DbRows, FieldInfo},
    server::Server,
    telemetry,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";

/// In-memory database answering page, count and EXPLAIN statements from fixtures.
#[derive(Default)]
pub struct FixtureDatabase {
    rows: Vec<Value>,
    total: i64,
    plan: Option<Value>,
    statements: Mutex<Vec<String>>,
}

impl FixtureDatabase {
    pub fn users(count: usize) -> Self {
        Self {
            rows: (1..=count)
                .map(|id| json!({ "id": id, "email": format!("user{id}@example.com") }))
                .collect(),
            total: count as i64,
            plan: Some(json!([{
                "Plan": {
                    "Node Type": "Seq Scan",
                    "Relation Name": "users",
                    "Startup Cost": 0.0,
                    "Total Cost": 35.5,
                    "Plan Rows": count
                }
            }])),
            ..Self::default()
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }
}

#[async_trait]
impl Database for FixtureDatabase {
    async fn query(&self, sql: &str) -> anyhow::Result<DbRows> {
        self.statements.lock().push(sql.to_string());

        if sql.starts_with("EXPLAIN") {
            let plan = self
                .plan
                .clone()
                .ok_or_else(|| anyhow::anyhow!("syntax error"))?;
            return Ok(DbRows {
                rows: vec![json!({ "QUERY PLAN": plan })],
                fields: vec![field("QUERY PLAN", "json")],
            });
        }

        if sql.starts_with("SELECT COUNT(*) AS total_count") {
            return Ok(DbRows {
                rows: vec![json!({ "total_count": self.total })],
                fields: vec![field("total_count", "int8")],
            });
        }

        Ok(DbRows {
            rows: self.rows.clone(),
            fields: vec![field("id", "int4"), field("email", "text")],
        })
    }
}

fn field(name: &str, type_name: &str) -> FieldInfo {
    FieldInfo {
        name: name.to_string(),
        type_name: type_name.to_string(),
    }
}

pub struct GatewayHarness {
    router: Router,
    pub database: Arc<FixtureDatabase>,
    pub store: Arc<MemoryStore>,
}

impl GatewayHarness {
    pub fn new(database: FixtureDatabase) -> Self {
        telemetry::init_with_default("warn");

        let mut config = AppConfig::embedded("postgres://fixture/querygate".to_string());
        config.api_key = Some(API_KEY.to_string());

        let database = Arc::new(database);
        let store = Arc::new(MemoryStore::new());
        let cache = QueryCache::new(
            store.clone(),
            CacheSettings::default(),
            Arc::new(CacheMetrics::new()),
        );
        let router = Server::from_parts(config, database.clone(), cache).router();

        Self {
            router,
            database,
            store,
        }
    }

    pub async fn post<T: Serialize>(&self, path: &str, payload: &T) -> http::Response<Body> {
        let body = serde_json::to_vec(payload).expect("request payload should serialize");
        self.send(
            Request::builder()
                .method("POST")
                .uri(path)
                .header(http::header::CONTENT_TYPE, "application/json")
                .header("x-api-key", API_KEY)
                .body(Body::from(body))
                .expect("failed to build harness request"),
        )
        .await
    }

    pub async fn get(&self, path: &str) -> http::Response<Body> {
        self.send(
            Request::builder()
                .method("GET")
                .uri(path)
                .header("x-api-key", API_KEY)
                .body(Body::empty())
                .expect("failed to build harness request"),
        )
        .await
    }

    pub async fn send(&self, request: Request<Body>) -> http::Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should be readable");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}
