//! Lexical safety gate for caller-supplied SQL.
//!
//! This is a denylist heuristic rather than a parser: statements must start with
//! `SELECT`, must not mention mutating or administrative keywords as whole words,
//! and must not contain known injection shapes. It runs before any other
//! component sees the text.

use crate::error::ServiceError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

pub const DEFAULT_MAX_QUERY_LENGTH: usize = 10_000;

/// Mutating, administrative, bulk-load and engine-internal words. Matched
/// case-insensitively on word boundaries so identifiers such as `updated_at`
/// or `created_by` pass.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert",
    "update",
    "delete",
    "drop",
    "create",
    "alter",
    "truncate",
    "grant",
    "revoke",
    "exec",
    "execute",
    "call",
    "declare",
    "set",
    "use",
    "backup",
    "restore",
    "shutdown",
    "merge",
    "copy",
    r"sp_\w*",
    r"xp_\w*",
    "load_file",
    "outfile",
    "dumpfile",
    "bulk",
    "openrowset",
    "opendatasource",
    "information_schema",
    "pg_catalog",
    "performance_schema",
    "mysql",
    "sys",
    "pg_shadow",
    "pg_authid",
];

static FORBIDDEN: Lazy<Regex> = Lazy::new(|| {
    let alternation = FORBIDDEN_KEYWORDS.join("|");
    Regex::new(&format!(r"\b(?:{alternation})\b")).expect("forbidden keyword pattern")
});

/// Injection shapes checked against the raw statement.
static INJECTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i);\s*(?:insert|update|delete|drop|create|alter|truncate|grant|revoke|exec|execute|merge)\b",
        r"(?i)\bunion\s+select\b",
        r"/\*",
        r"\*/",
        r"--",
        r"#",
        r"(?i)\b(?:xp_cmdshell|sp_executesql|sp_configure|sp_oacreate|pg_read_file|pg_read_binary_file|pg_ls_dir|lo_import|lo_export|dblink_exec)\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("injection pattern"))
    .collect()
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Only SELECT statements are allowed")]
    NotSelect,

    #[error("Forbidden keyword detected: {0}")]
    ForbiddenKeyword(String),

    #[error("Potential SQL injection detected")]
    InjectionPattern,

    #[error("Query too long")]
    TooLong { length: usize, max: usize },

    #[error("Unbalanced parentheses in query")]
    UnbalancedParentheses,
}

impl From<ValidationError> for ServiceError {
    fn from(err: ValidationError) -> Self {
        ServiceError::Validation(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SqlValidator {
    max_length: usize,
}

impl Default for SqlValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUERY_LENGTH)
    }
}

impl SqlValidator {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    /// Runs every rule in order and stops at the first violation.
    pub fn validate(&self, sql: &str) -> Result<(), ValidationError> {
        let normalized = sql.trim().to_lowercase();

        if !normalized.starts_with("select") {
            return Err(ValidationError::NotSelect);
        }

        if let Some(found) = FORBIDDEN.find(&normalized) {
            return Err(ValidationError::ForbiddenKeyword(
                found.as_str().to_uppercase(),
            ));
        }

        if INJECTION_PATTERNS.iter().any(|pattern| pattern.is_match(sql)) {
            return Err(ValidationError::InjectionPattern);
        }

        let length = sql.chars().count();
        if length > self.max_length {
            return Err(ValidationError::TooLong {
                length,
                max: self.max_length,
            });
        }

        let opening = sql.matches('(').count();
        let closing = sql.matches(')').count();
        if opening != closing {
            return Err(ValidationError::UnbalancedParentheses);
        }

        Ok(())
    }
}
