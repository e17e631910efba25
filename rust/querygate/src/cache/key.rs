use sha2::{Digest, Sha256};

/// Namespace shared by every result-cache entry.
pub const QUERY_KEY_PREFIX: &str = "querygate:query:";

/// Derives the cache key for one page of one statement.
///
/// The key is a SHA-256 over the exact statement text plus page coordinates, so
/// statements that differ only in whitespace or case never share an entry.
pub fn query_cache_key(sql: &str, page: i64, page_size: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    hasher.update(b":");
    hasher.update(page.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(page_size.to_string().as_bytes());
    format!("{QUERY_KEY_PREFIX}{:x}", hasher.finalize())
}

/// Glob matching every result-cache entry.
pub fn query_key_pattern() -> String {
    format!("{QUERY_KEY_PREFIX}*")
}
