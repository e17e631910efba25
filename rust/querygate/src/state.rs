use crate::{
    error::{Result, ServiceError},
    query::QueryEngine,
};
use axum::http::HeaderMap;
use std::sync::Arc;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Handler state: the engine plus the credential API routes require.
#[derive(Clone)]
pub struct AppState {
    pub engine: QueryEngine,
    api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(engine: QueryEngine) -> Self {
        let api_key = engine.config().api_key.as_deref().map(Arc::from);
        Self { engine, api_key }
    }

    /// No-op when no key is configured.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<()> {
        let Some(expected) = self.api_key.as_deref() else {
            return Ok(());
        };

        let provided = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok());

        if provided == Some(expected) {
            Ok(())
        } else {
            Err(ServiceError::Auth)
        }
    }
}
