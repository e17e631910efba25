//! Request orchestration: validate, then either explain (dry-run) or serve a
//! page through the cache-aside path.

use crate::{
    cache::{query_cache_key, query_key_pattern, QueryCache},
    config::AppConfig,
    db::Database,
    error::Result,
    executor::QueryExecutor,
    explain::PlanAnalyzer,
    models::{QueryRequest, QueryResponse, QueryResult},
    pagination::{rewrite, PaginationSpec},
    validator::SqlValidator,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct QueryEngine {
    config: Arc<AppConfig>,
    validator: SqlValidator,
    executor: QueryExecutor,
    analyzer: PlanAnalyzer,
    cache: QueryCache,
}

impl QueryEngine {
    pub fn new(db: Arc<dyn Database>, cache: QueryCache, config: Arc<AppConfig>) -> Self {
        Self {
            validator: SqlValidator::new(config.max_query_length),
            executor: QueryExecutor::new(Arc::clone(&db)),
            analyzer: PlanAnalyzer::new(db, config.dialect),
            cache,
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub async fn execute_query(&self, request: QueryRequest) -> Result<QueryResponse> {
        self.validator.validate(&request.sql)?;

        if request.dry_run {
            return Ok(QueryResponse::Explain(self.analyzer.explain(&request.sql).await));
        }

        let spec = PaginationSpec::from_config(&self.config, request.page, request.page_size);
        let use_cache = request.use_cache && self.cache.enabled();
        let key = query_cache_key(&request.sql, spec.page, spec.page_size);

        if use_cache {
            if let Some(mut cached) = self.cache.get::<QueryResult>(&key).await {
                cached.from_cache = true;
                return Ok(QueryResponse::Rows(cached));
            }
        }

        let statements = rewrite(
            &request.sql,
            spec.page_size,
            spec.offset,
            self.config.dialect,
        );
        debug!(
            sql = %statements.sql,
            effective_limit = statements.effective_limit,
            offset = statements.offset,
            "executing paginated query"
        );

        let result = self.executor.execute(&statements, &spec).await?;

        if use_cache && !result.rows.is_empty() {
            self.cache
                .set(&key, &result, self.cache.ttl_seconds())
                .await;
        }

        Ok(QueryResponse::Rows(result))
    }

    /// `type=all` without a pattern flushes the store; anything else deletes
    /// keys matching the pattern (result entries by default).
    pub async fn invalidate(&self, request: InvalidateRequest) -> InvalidateResponse {
        let flush_all = request.pattern.is_none()
            && request
                .kind
                .as_deref()
                .is_some_and(|kind| kind.eq_ignore_ascii_case("all"));

        if flush_all {
            let flushed = self.cache.flush().await;
            info!(flushed, "cache flush requested");
            return InvalidateResponse {
                deleted: 0,
                flushed,
            };
        }

        let pattern = request.pattern.unwrap_or_else(query_key_pattern);
        let deleted = self.cache.del_pattern(&pattern).await;
        info!(pattern = %pattern, deleted, "cache invalidation requested");
        InvalidateResponse {
            deleted,
            flushed: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InvalidateRequest {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidateResponse {
    pub deleted: u64,
    pub flushed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{testing::FailingStore, CacheMetrics, CacheSettings, MemoryStore},
        error::ServiceError,
        executor::testing::FakeDatabase,
    };
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn rows(count: usize) -> Vec<Value> {
        (0..count)
            .map(|i| json!({ "id": i, "name": format!("user-{i}") }))
            .collect()
    }

    fn engine_with(db: Arc<FakeDatabase>) -> (QueryEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let cache = QueryCache::new(
            store.clone(),
            CacheSettings::default(),
            Arc::new(CacheMetrics::new()),
        );
        let config = Arc::new(AppConfig::embedded("postgres://unused/db".to_string()));
        (QueryEngine::new(db, cache, config), store)
    }

    fn expect_rows(response: QueryResponse) -> QueryResult {
        match response {
            QueryResponse::Rows(result) => result,
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_identical_request_is_served_from_cache() {
        let db = Arc::new(FakeDatabase::with_rows(rows(5), 12));
        let (engine, _) = engine_with(db.clone());
        let request = QueryRequest::new("SELECT id, name FROM users").page(1, 5);

        let first = expect_rows(engine.execute_query(request.clone()).await.unwrap());
        let second = expect_rows(engine.execute_query(request).await.unwrap());

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.rows, second.rows);
        assert_eq!(first.metadata, second.metadata);
        assert_eq!(first.pagination, second.pagination);
        assert_eq!(db.statements().len(), 2, "second call must not hit the database");

        let stats = engine.cache().stats();
        assert_eq!(stats.metrics.hits, 1);
        assert_eq!(stats.metrics.misses, 1);
    }

    #[tokio::test]
    async fn different_pages_use_different_entries() {
        let db = Arc::new(FakeDatabase::with_rows(rows(5), 12));
        let (engine, store) = engine_with(db.clone());

        engine
            .execute_query(QueryRequest::new("SELECT id, name FROM users").page(1, 5))
            .await
            .unwrap();
        let second = expect_rows(
            engine
                .execute_query(QueryRequest::new("SELECT id, name FROM users").page(2, 5))
                .await
                .unwrap(),
        );

        assert!(!second.from_cache);
        assert_eq!(store.len(), 2);
        assert!(db
            .statements()
            .contains(&"SELECT id, name FROM users LIMIT 5 OFFSET 5".to_string()));
    }

    #[tokio::test]
    async fn empty_results_are_not_cached() {
        let db = Arc::new(FakeDatabase::with_rows(Vec::new(), 0));
        let (engine, store) = engine_with(db);

        let result = expect_rows(
            engine
                .execute_query(QueryRequest::new("SELECT id FROM users WHERE false"))
                .await
                .unwrap(),
        );

        assert!(result.rows.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn use_cache_false_bypasses_lookup_and_store() {
        let db = Arc::new(FakeDatabase::with_rows(rows(2), 2));
        let (engine, store) = engine_with(db.clone());
        let request = QueryRequest::new("SELECT id, name FROM users").without_cache();

        engine.execute_query(request.clone()).await.unwrap();
        let second = expect_rows(engine.execute_query(request).await.unwrap());

        assert!(!second.from_cache);
        assert!(store.is_empty());
        assert_eq!(db.statements().len(), 4);
        assert_eq!(engine.cache().stats().metrics.total_requests, 0);
    }

    #[tokio::test]
    async fn existing_limit_bounds_the_page() {
        let db = Arc::new(FakeDatabase::with_rows(rows(5), 10));
        let (engine, _) = engine_with(db.clone());

        let result = expect_rows(
            engine
                .execute_query(QueryRequest::new("SELECT id FROM users LIMIT 10").page(1, 5))
                .await
                .unwrap(),
        );

        assert!(result.rows.len() <= 5);
        assert_eq!(result.metadata.row_count, result.rows.len());
        assert_eq!(result.pagination.total_pages, 2);
        assert!(db
            .statements()
            .contains(&"SELECT id FROM users LIMIT 5 OFFSET 0".to_string()));
    }

    #[tokio::test]
    async fn validation_failure_runs_nothing() {
        let db = Arc::new(FakeDatabase::with_rows(rows(1), 1));
        let (engine, _) = engine_with(db.clone());

        let err = engine
            .execute_query(QueryRequest::new("DELETE FROM users"))
            .await
            .expect_err("mutations are rejected");

        assert!(matches!(err, ServiceError::Validation(ref msg) if msg == "Only SELECT statements are allowed"));
        assert!(db.statements().is_empty());
    }

    #[tokio::test]
    async fn dry_run_skips_cache_and_pagination() {
        let db = Arc::new(FakeDatabase {
            explain_plan: Some(json!([{ "Plan": { "Node Type": "Result", "Total Cost": 0.01, "Plan Rows": 1 } }])),
            ..FakeDatabase::default()
        });
        let (engine, store) = engine_with(db.clone());

        let response = engine
            .execute_query(QueryRequest::new("SELECT 1").dry_run())
            .await
            .unwrap();

        match response {
            QueryResponse::Explain(result) => {
                assert!(result.is_valid);
                assert!(result.warnings.is_empty());
            }
            other => panic!("expected explain result, got {other:?}"),
        }
        assert_eq!(db.statements(), vec!["EXPLAIN (FORMAT JSON) SELECT 1".to_string()]);
        assert!(store.is_empty());
        assert_eq!(engine.cache().stats().metrics.total_requests, 0);
    }

    #[tokio::test]
    async fn invalidate_all_flushes_and_pattern_deletes() {
        let db = Arc::new(FakeDatabase::with_rows(rows(1), 1));
        let (engine, store) = engine_with(db);
        engine
            .execute_query(QueryRequest::new("SELECT id, name FROM users"))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        let response = engine.invalidate(InvalidateRequest::default()).await;
        assert_eq!(
            response,
            InvalidateResponse {
                deleted: 1,
                flushed: false
            }
        );

        let response = engine.invalidate(InvalidateRequest::default()).await;
        assert_eq!(response.deleted, 0);

        engine
            .execute_query(QueryRequest::new("SELECT id, name FROM users"))
            .await
            .unwrap();
        let response = engine
            .invalidate(InvalidateRequest {
                kind: Some("all".into()),
                pattern: None,
            })
            .await;
        assert!(response.flushed);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unreachable_cache_store_degrades_to_live_queries() {
        let db = Arc::new(FakeDatabase::with_rows(rows(3), 3));
        let cache = QueryCache::new(
            Arc::new(FailingStore),
            CacheSettings::default(),
            Arc::new(CacheMetrics::new()),
        );
        let config = Arc::new(AppConfig::embedded("postgres://unused/db".to_string()));
        let engine = QueryEngine::new(db.clone(), cache, config);
        let request = QueryRequest::new("SELECT id, name FROM users");

        let first = expect_rows(engine.execute_query(request.clone()).await.unwrap());
        assert!(!first.from_cache);
        assert_eq!(first.rows.len(), 3);
        assert_eq!(engine.cache().stats().metrics.errors, 1);

        let second = expect_rows(engine.execute_query(request).await.unwrap());
        assert!(!second.from_cache);
        assert_eq!(db.statements().len(), 4, "every request runs live");
        assert_eq!(engine.cache().stats().metrics.errors, 2);

        let response = engine.invalidate(InvalidateRequest::default()).await;
        assert_eq!(
            response,
            InvalidateResponse {
                deleted: 0,
                flushed: false
            }
        );
    }

    #[tokio::test]
    async fn oversize_results_are_returned_uncached() {
        let db = Arc::new(FakeDatabase::with_rows(rows(20), 20));
        let store = Arc::new(MemoryStore::new());
        let cache = QueryCache::new(
            store.clone(),
            CacheSettings {
                max_value_bytes: 128,
                compress_large_values: false,
                ..CacheSettings::default()
            },
            Arc::new(CacheMetrics::new()),
        );
        let config = Arc::new(AppConfig::embedded("postgres://unused/db".to_string()));
        let engine = QueryEngine::new(db, cache, config);

        let result = expect_rows(
            engine
                .execute_query(QueryRequest::new("SELECT id, name FROM users"))
                .await
                .unwrap(),
        );

        assert_eq!(result.rows.len(), 20);
        assert!(!result.from_cache);
        assert!(store.is_empty());
    }
}
