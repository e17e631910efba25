//! Limit/offset injection for arbitrary statement text.
//!
//! Only a `LIMIT n [OFFSET m]` clause at the very end of the statement is
//! recognized as an existing limit. Limits inside subqueries are left alone.

use crate::{config::AppConfig, dialect::Dialect, models::PaginationMeta};
use once_cell::sync::Lazy;
use regex::Regex;

static TRAILING_LIMIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\blimit\s+(\d+)(?:\s+offset\s+(\d+))?\s*$").expect("trailing limit pattern")
});

/// Clamped page coordinates for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationSpec {
    pub page: i64,
    pub page_size: i64,
    pub offset: i64,
}

impl PaginationSpec {
    /// Clamps `page` to at least 1 and replaces a page size outside
    /// `[1, max_page_size]` with the configured default.
    pub fn new(page: Option<i64>, page_size: Option<i64>, default_size: i64, max_size: i64) -> Self {
        let page = page.unwrap_or(1).max(1);
        let page_size = match page_size {
            Some(size) if (1..=max_size).contains(&size) => size,
            _ => default_size,
        };
        let offset = (page - 1).saturating_mul(page_size);

        Self {
            page,
            page_size,
            offset,
        }
    }

    pub fn from_config(config: &AppConfig, page: Option<i64>, page_size: Option<i64>) -> Self {
        Self::new(
            page,
            page_size,
            config.default_page_size,
            config.max_page_size,
        )
    }

    pub fn meta(&self, total_rows: i64) -> PaginationMeta {
        let total_rows = total_rows.max(0);
        let total_pages = if total_rows == 0 {
            0
        } else {
            (total_rows - 1) / self.page_size + 1
        };

        PaginationMeta {
            page: self.page,
            page_size: self.page_size,
            total_rows,
            total_pages,
            has_next_page: self.page < total_pages,
            has_previous_page: self.page > 1,
        }
    }
}

/// Bounded statement plus its companion count statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginatedSql {
    pub sql: String,
    pub count_sql: String,
    pub effective_limit: i64,
    pub offset: i64,
}

pub fn strip_trailing_semicolons(sql: &str) -> &str {
    let mut current = sql.trim();
    while let Some(rest) = current.strip_suffix(';') {
        current = rest.trim_end();
    }
    current
}

/// Rewrites a validated statement into a paginated statement and a count statement.
pub fn rewrite(sql: &str, requested_limit: i64, offset: i64, dialect: Dialect) -> PaginatedSql {
    let base = strip_trailing_semicolons(sql);

    let (body, effective_limit) = match TRAILING_LIMIT.captures(base) {
        Some(captures) => {
            let existing = captures
                .get(1)
                .and_then(|m| m.as_str().parse::<i64>().ok())
                .unwrap_or(i64::MAX);
            let start = captures.get(0).map(|m| m.start()).unwrap_or(base.len());
            (base[..start].trim_end(), existing.min(requested_limit))
        }
        None => (base, requested_limit),
    };

    PaginatedSql {
        sql: format!("{body} {}", dialect.limit_clause(effective_limit, offset)),
        count_sql: format!("SELECT COUNT(*) AS total_count FROM ({base}) AS count_query"),
        effective_limit,
        offset,
    }
}
