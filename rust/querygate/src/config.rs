use crate::dialect::Dialect;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env,
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub max_pool_size: u32,
    pub api_key: Option<String>,
    pub dialect: Dialect,
    pub default_page_size: i64,
    pub max_page_size: i64,
    pub max_query_length: usize,
    pub statement_timeout: Duration,
    pub pg_ssl_root_cert: Option<String>,
    pub pg_ssl_cert: Option<String>,
    pub pg_ssl_key: Option<String>,
    pub cache: CacheConfig,
}

/// Result cache policy.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub redis_url: Option<String>,
    pub ttl_seconds: u64,
    /// Serialized values above this size are compressed or rejected.
    pub max_value_bytes: usize,
    pub compress_large_values: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            ttl_seconds: default_cache_ttl_secs(),
            max_value_bytes: default_cache_max_value_bytes(),
            compress_large_values: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    querygate_listen_addr: Option<String>,
    #[serde(default)]
    querygate_listen_host: Option<String>,
    #[serde(default)]
    querygate_listen_port: Option<u16>,
    #[serde(default)]
    querygate_database_url: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default = "default_pool_size")]
    querygate_max_pool_size: u32,
    #[serde(default)]
    querygate_api_key: Option<String>,
    #[serde(default)]
    querygate_dialect: Option<String>,
    #[serde(default = "default_page_size")]
    querygate_default_page_size: i64,
    #[serde(default = "default_max_page_size")]
    querygate_max_page_size: i64,
    #[serde(default = "default_max_query_length")]
    querygate_max_query_length: usize,
    #[serde(default = "default_statement_timeout_secs")]
    querygate_statement_timeout_secs: u64,
    #[serde(default = "default_true")]
    querygate_cache_enabled: bool,
    #[serde(default)]
    querygate_redis_url: Option<String>,
    #[serde(default)]
    redis_url: Option<String>,
    #[serde(default = "default_cache_ttl_secs")]
    querygate_cache_ttl_secs: u64,
    #[serde(default = "default_cache_max_value_bytes")]
    querygate_cache_max_value_bytes: usize,
    #[serde(default)]
    querygate_cache_compress_large: bool,
    #[serde(default)]
    pgsslrootcert: Option<String>,
    #[serde(default)]
    pgsslcert: Option<String>,
    #[serde(default)]
    pgsslkey: Option<String>,
}

const fn default_pool_size() -> u32 {
    10
}

const fn default_page_size() -> i64 {
    50
}

const fn default_max_page_size() -> i64 {
    100
}

const fn default_max_query_length() -> usize {
    10_000
}

const fn default_statement_timeout_secs() -> u64 {
    30
}

const fn default_true() -> bool {
    true
}

const fn default_cache_ttl_secs() -> u64 {
    300
}

const fn default_cache_max_value_bytes() -> usize {
    1024 * 1024
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse QUERYGATE_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.querygate_listen_addr,
            raw.querygate_listen_host,
            raw.querygate_listen_port,
        )?;

        let database_url = raw
            .querygate_database_url
            .or(raw.database_url)
            .or_else(|| env::var("DATABASE_URL").ok())
            .context("QUERYGATE_DATABASE_URL or DATABASE_URL must be set")?;

        let dialect = match raw.querygate_dialect.as_deref() {
            Some(value) => value
                .parse::<Dialect>()
                .map_err(anyhow::Error::msg)
                .context("invalid QUERYGATE_DIALECT value")?,
            None => Dialect::default(),
        };

        let redis_url = raw
            .querygate_redis_url
            .or(raw.redis_url)
            .filter(|url| !url.trim().is_empty());

        let max_page_size = raw.querygate_max_page_size.max(1);

        Ok(Self {
            listen_addr,
            database_url,
            max_pool_size: raw.querygate_max_pool_size.max(1),
            api_key: raw.querygate_api_key.filter(|key| !key.is_empty()),
            dialect,
            default_page_size: raw.querygate_default_page_size.clamp(1, max_page_size),
            max_page_size,
            max_query_length: raw.querygate_max_query_length.max(1),
            statement_timeout: Duration::from_secs(raw.querygate_statement_timeout_secs.max(1)),
            pg_ssl_root_cert: raw.pgsslrootcert,
            pg_ssl_cert: raw.pgsslcert,
            pg_ssl_key: raw.pgsslkey,
            cache: CacheConfig {
                enabled: raw.querygate_cache_enabled,
                redis_url,
                ttl_seconds: raw.querygate_cache_ttl_secs.max(1),
                max_value_bytes: raw.querygate_cache_max_value_bytes.max(1),
                compress_large_values: raw.querygate_cache_compress_large,
            },
        })
    }

    /// Configuration with every default applied, for embedders and tests.
    pub fn embedded(database_url: String) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            database_url,
            max_pool_size: default_pool_size(),
            api_key: None,
            dialect: Dialect::default(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            max_query_length: default_max_query_length(),
            statement_timeout: Duration::from_secs(default_statement_timeout_secs()),
            pg_ssl_root_cert: None,
            pg_ssl_cert: None,
            pg_ssl_key: None,
            cache: CacheConfig::default(),
        }
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid QUERYGATE_LISTEN_ADDR value")?
            .next()
            .context("QUERYGATE_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8490);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}
