use crate::{
    cache::{CacheStats, QueryCache},
    config::AppConfig,
    db::{self, Database, PgDatabase},
    dialect::Dialect,
    error::{Result, ServiceError},
    models::{QueryRequest, QueryResponse},
    query::{InvalidateRequest, InvalidateResponse, QueryEngine},
    state::AppState,
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        if config.dialect == Dialect::MySql {
            return Err(ServiceError::Config(
                "QUERYGATE_DIALECT=mysql requires an embedder-supplied database; the bundled driver is PostgreSQL"
                    .into(),
            )
            .into());
        }

        let pool = db::connect_pool(&config).await?;
        let cache = QueryCache::from_config(&config.cache).await?;
        info!(
            dialect = %config.dialect,
            cache_enabled = cache.enabled(),
            redis = config.cache.redis_url.is_some(),
            "query gateway initialized"
        );
        Ok(Self::from_parts(config, Arc::new(PgDatabase::new(pool)), cache))
    }

    /// Builds a server around caller-provided collaborators.
    pub fn from_parts(config: AppConfig, database: Arc<dyn Database>, cache: QueryCache) -> Self {
        let config = Arc::new(config);
        let engine = QueryEngine::new(database, cache, Arc::clone(&config));
        let state = AppState::new(engine);

        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/query", post(Self::query))
            .route("/api/cache/stats", get(Self::cache_stats))
            .route("/api/cache/invalidate", post(Self::invalidate_cache))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "query gateway listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<serde_json::Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn query(
        State(state): State<AppState>,
        headers: HeaderMap,
        payload: std::result::Result<Json<QueryRequest>, JsonRejection>,
    ) -> Result<Json<QueryResponse>> {
        state.authorize(&headers)?;
        let Json(request) = payload?;
        let span = info_span!(
            "query",
            request_id = %Uuid::new_v4(),
            dry_run = request.dry_run,
            use_cache = request.use_cache
        );
        let response = state.engine.execute_query(request).instrument(span).await?;
        Ok(Json(response))
    }

    async fn cache_stats(
        State(state): State<AppState>,
        headers: HeaderMap,
    ) -> Result<Json<CacheStats>> {
        state.authorize(&headers)?;
        Ok(Json(state.engine.cache().stats()))
    }

    async fn invalidate_cache(
        State(state): State<AppState>,
        headers: HeaderMap,
        payload: std::result::Result<Json<InvalidateRequest>, JsonRejection>,
    ) -> Result<Json<InvalidateResponse>> {
        state.authorize(&headers)?;
        let Json(request) = payload?;
        Ok(Json(state.engine.invalidate(request).await))
    }
}
