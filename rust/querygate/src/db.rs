use crate::config::AppConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bb8::{ManageConnection, Pool};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::BufReader;
use std::time::Duration;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Client, Config as PgConfig, NoTls, Row};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Column name and engine-reported type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub type_name: String,
}

/// Rows as JSON objects in column order, plus column metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbRows {
    pub rows: Vec<Value>,
    pub fields: Vec<FieldInfo>,
}

/// The relational database the gateway reads from.
#[async_trait]
pub trait Database: Send + Sync {
    async fn query(&self, sql: &str) -> Result<DbRows>;
}

pub type PgPool = Pool<PgConnectionManager>;

pub async fn connect_pool(config: &AppConfig) -> Result<PgPool> {
    let manager = PgConnectionManager::new(
        &config.database_url,
        config.statement_timeout,
        config.pg_ssl_root_cert.as_deref(),
        config.pg_ssl_cert.as_deref(),
        config.pg_ssl_key.as_deref(),
    )?;
    let pool = Pool::builder()
        .max_size(config.max_pool_size)
        .build(manager)
        .await
        .context("failed to build PostgreSQL connection pool")?;

    // Perform a one-time connectivity check so we fail fast if credentials are wrong.
    match pool.get().await {
        Ok(_) => info!("database connectivity check succeeded"),
        Err(err) => error!(error = ?err, "initial database connectivity check failed"),
    }

    Ok(pool)
}

#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn query(&self, sql: &str) -> Result<DbRows> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|err| anyhow::anyhow!("failed to acquire database connection: {err:?}"))?;

        let statement = conn.prepare(sql).await?;
        let fields: Vec<FieldInfo> = statement
            .columns()
            .iter()
            .map(|column| FieldInfo {
                name: column.name().to_string(),
                type_name: column.type_().name().to_string(),
            })
            .collect();

        let rows = conn.query(&statement, &[]).await?;
        Ok(DbRows {
            rows: rows.iter().map(row_to_json).collect(),
            fields,
        })
    }
}

#[derive(Clone)]
pub struct PgConnectionManager {
    config: PgConfig,
    tls: PgTls,
}

#[derive(Clone)]
enum PgTls {
    None,
    Rustls(MakeRustlsConnect),
}

impl PgConnectionManager {
    fn new(
        database_url: &str,
        statement_timeout: Duration,
        root_cert: Option<&str>,
        client_cert: Option<&str>,
        client_key: Option<&str>,
    ) -> Result<Self> {
        let mut config = database_url
            .parse::<PgConfig>()
            .context("invalid DATABASE_URL")?;
        // Sessions are read-only at the server as well; the validator is the first gate.
        config.options(&format!(
            "-c default_transaction_read_only=on -c statement_timeout={}",
            statement_timeout.as_millis()
        ));
        let tls = if let Some(path) = root_cert {
            PgTls::Rustls(build_tls_connector(path, client_cert, client_key)?)
        } else {
            PgTls::None
        };
        Ok(Self { config, tls })
    }
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = Client;
    type Error = anyhow::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let config = self.config.clone();
        match &self.tls {
            PgTls::None => {
                let (client, connection) = config.connect(NoTls).await?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        error!(error = %err, "postgres connection closed with error");
                    }
                });
                Ok(client)
            }
            PgTls::Rustls(connector) => {
                let (client, connection) = config.connect(connector.clone()).await?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        error!(error = %err, "postgres connection closed with error");
                    }
                });
                Ok(client)
            }
        }
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_closed()
    }
}

fn build_tls_connector(
    root_cert: &str,
    client_cert: Option<&str>,
    client_key: Option<&str>,
) -> Result<MakeRustlsConnect> {
    let mut reader = BufReader::new(File::open(root_cert).context("failed to open PGSSLROOTCERT")?);
    let mut root_store = RootCertStore::empty();
    for cert in certs(&mut reader) {
        let cert = cert.context("failed to parse PGSSLROOTCERT")?;
        root_store
            .add(cert)
            .map_err(|_| anyhow::anyhow!("invalid certificate in PGSSLROOTCERT"))?;
    }

    Ok(MakeRustlsConnect::new(build_client_config(
        root_store,
        root_cert,
        client_cert,
        client_key,
    )?))
}

fn build_client_config(
    root_store: RootCertStore,
    root_cert: &str,
    client_cert: Option<&str>,
    client_key: Option<&str>,
) -> Result<ClientConfig> {
    let builder = ClientConfig::builder().with_root_certificates(root_store);

    match (client_cert, client_key) {
        (None, None) => Ok(builder.with_no_client_auth()),
        (Some(cert), Some(key)) => {
            let certs = load_client_certs(cert)?;
            let key = load_client_key(key)?;
            builder
                .with_client_auth_cert(certs, key)
                .with_context(|| format!("failed to build client TLS config for {root_cert}"))
        }
        _ => anyhow::bail!("PGSSLCERT and PGSSLKEY must both be set (or neither)"),
    }
}

fn load_client_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open PGSSLCERT file '{path}'"))?,
    );

    let chain = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to parse PGSSLCERT")?;

    if chain.is_empty() {
        anyhow::bail!("PGSSLCERT contained no certificates");
    }

    Ok(chain)
}

fn load_client_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open PGSSLKEY file '{path}'"))?,
    );

    rustls_pemfile::private_key(&mut reader)
        .context("failed to parse PGSSLKEY")?
        .context("PGSSLKEY contained no private keys")
}

fn row_to_json(row: &Row) -> Value {
    let mut object = Map::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), column_value(row, idx, column.type_()));
    }
    Value::Object(object)
}

fn column_value(row: &Row, idx: usize, ty: &Type) -> Value {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx).map(|v| v.map(Value::from)),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx).map(|v| v.map(Value::from)),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx).map(|v| v.map(Value::from)),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).map(|v| v.map(Value::from)),
        Type::OID => row.try_get::<_, Option<u32>>(idx).map(|v| v.map(Value::from)),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx).map(|v| v.map(Value::from)),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).map(|v| v.map(Value::from)),
        Type::NUMERIC => row
            .try_get::<_, Option<FiniteNumeric>>(idx)
            .map(|v| v.map(|n| Value::String(n.0.to_string()))),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            row.try_get::<_, Option<String>>(idx).map(|v| v.map(Value::from))
        }
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .map(|v| v.map(|ts| Value::String(ts.to_rfc3339()))),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .map(|v| v.map(|ts| Value::String(ts.to_string()))),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .map(|v| v.map(|d| Value::String(d.to_string()))),
        Type::UUID => row
            .try_get::<_, Option<Uuid>>(idx)
            .map(|v| v.map(|id| Value::String(id.to_string()))),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => row
            .try_get::<_, Option<Vec<String>>>(idx)
            .map(|v| v.map(Value::from)),
        Type::INT4_ARRAY => row
            .try_get::<_, Option<Vec<i32>>>(idx)
            .map(|v| v.map(Value::from)),
        Type::INT8_ARRAY => row
            .try_get::<_, Option<Vec<i64>>>(idx)
            .map(|v| v.map(Value::from)),
        _ => {
            debug!(column = idx, column_type = %ty, "unsupported column type rendered as null");
            return Value::Null;
        }
    };

    match value {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        Err(err) => {
            debug!(column = idx, column_type = %ty, error = %err, "failed to decode column");
            Value::Null
        }
    }
}

/// Finite `numeric` values. NaN and the infinities are refused so they render
/// as null instead of a number.
struct FiniteNumeric(Decimal);

const NUMERIC_SPECIAL_SIGNS: [u16; 3] = [0xC000, 0xD000, 0xF000];

impl<'a> FromSql<'a> for FiniteNumeric {
    fn from_sql(
        ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let sign = raw
            .get(4..6)
            .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]));
        if sign.is_some_and(|sign| NUMERIC_SPECIAL_SIGNS.contains(&sign)) {
            return Err("non-finite numeric value".into());
        }
        Decimal::from_sql(ty, raw).map(FiniteNumeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}
