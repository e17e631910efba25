use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Longest statement excerpt attached to execution errors.
const STATEMENT_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// A validator rule rejected the statement. The message is shown verbatim.
    #[error("{0}")]
    Validation(String),

    #[error("Query execution failed: {message}")]
    Execution { message: String, statement: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ServiceError {
    pub fn execution(err: &anyhow::Error, statement: &str) -> Self {
        ServiceError::Execution {
            message: format!("{err:#}"),
            statement: truncate_statement(statement),
        }
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        ServiceError::InvalidRequest(rejection.body_text())
    }
}

/// Shortens statement text for logs and error context.
pub fn truncate_statement(sql: &str) -> String {
    let mut chars = sql.chars();
    let excerpt: String = chars.by_ref().take(STATEMENT_EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{excerpt}...")
    } else {
        excerpt
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Execution { .. } => StatusCode::BAD_GATEWAY,
            ServiceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        };

        match &self {
            ServiceError::Validation(_) | ServiceError::InvalidRequest(_) | ServiceError::Auth => {}
            ServiceError::Execution { statement, .. } => {
                error!(error = %self, statement = %statement, "query execution failed");
            }
            _ => error!(error = %self, "request failed"),
        }

        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
