//! PostgreSQL query helpers.

use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};

use crate::config::PostgresConfig;
use crate::error::{require, Result, TetherError};

/// A positional query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// SQL NULL (bound as text).
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// Double precision float.
    Float(f64),
    /// Text.
    Text(String),
    /// JSONB.
    Json(Value),
}

impl From<bool> for SqlParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for SqlParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for SqlParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlParam {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Value> for SqlParam {
    fn from(v: Value) -> Self {
        Self::Json(v)
    }
}

fn bind_all<'q>(mut query: Query<'q, Postgres, PgArguments>, params: &'q [SqlParam]) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Null => query.bind(None::<String>),
            SqlParam::Bool(v) => query.bind(*v),
            SqlParam::Int(v) => query.bind(*v),
            SqlParam::Float(v) => query.bind(*v),
            SqlParam::Text(v) => query.bind(v.as_str()),
            SqlParam::Json(v) => query.bind(v),
        };
    }
    query
}

/// PostgreSQL connection pool with query helpers.
///
/// Pooled connections are replaced once they are older than the configured
/// expiry.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Open a pool.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        require("database url", &config.url)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .max_lifetime(config.expiry)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| match TetherError::from(e) {
                TetherError::Database(msg) => {
                    TetherError::Connection(format!("Failed to connect to PostgreSQL: {msg}"))
                }
                other => other,
            })?;

        tracing::info!(max_connections = config.max_connections, "PostgreSQL pool ready");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64> {
        require("query", sql)?;
        let result = bind_all(sqlx::query(sql), params).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// First row of a query, or `None` when it returns nothing.
    pub async fn fetch_one(&self, sql: &str, params: &[SqlParam]) -> Result<Option<PgRow>> {
        require("query", sql)?;
        Ok(bind_all(sqlx::query(sql), params)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// All rows of a query.
    pub async fn fetch_all(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<PgRow>> {
        require("query", sql)?;
        Ok(bind_all(sqlx::query(sql), params).fetch_all(&self.pool).await?)
    }

    /// All rows of a query as JSON objects keyed by column name.
    pub async fn fetch_json(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<Value>> {
        require("query", sql)?;
        let wrapped = json_query(sql);
        let rows = bind_all(sqlx::query(&wrapped), params).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<Value, _>(0).map_err(TetherError::from))
            .collect()
    }
}

fn json_query(sql: &str) -> String {
    let sql = sql.trim().trim_end_matches(';');
    format!("SELECT row_to_json(t) FROM ({sql}) AS t")
}
