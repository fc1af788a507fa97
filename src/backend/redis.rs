//! JSON-aware Redis cache operations.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::RedisConfig;
use crate::error::{require, Result, TetherError};
use crate::job::{JobId, WorkResult};
use crate::status::{JobState, JobStatus, ResultStore};

/// Digest applied to hashed cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-224.
    Sha224,
    /// SHA-256.
    #[default]
    Sha256,
    /// SHA-384.
    Sha384,
    /// SHA-512.
    Sha512,
}

impl HashAlgorithm {
    /// Hex digest of `input`.
    pub fn hex_digest(&self, input: &[u8]) -> String {
        match self {
            Self::Sha224 => hex::encode(Sha224::digest(input)),
            Self::Sha256 => hex::encode(Sha256::digest(input)),
            Self::Sha384 => hex::encode(Sha384::digest(input)),
            Self::Sha512 => hex::encode(Sha512::digest(input)),
        }
    }
}

/// Build a normalized cache key from a flat JSON object.
///
/// Keys are sorted; null values and empty arrays are skipped; each value is
/// rendered as compact JSON with quotes removed. With `hash` set, the key is
/// replaced by its hex digest.
pub fn build_cache_key(
    payload: &serde_json::Map<String, Value>,
    separator: &str,
    hash: Option<HashAlgorithm>,
) -> Result<String> {
    let mut pieces = Vec::with_capacity(payload.len());
    let mut keys: Vec<&String> = payload.keys().collect();
    keys.sort();

    for key in keys {
        let value = &payload[key.as_str()];
        match value {
            Value::Null => continue,
            Value::Array(items) if items.is_empty() => continue,
            _ => {}
        }
        let rendered = serde_json::to_string(value)?.replace('"', "");
        pieces.push(format!("{key}={rendered}"));
    }

    let key = pieces.join(separator);
    Ok(match hash {
        Some(algorithm) => algorithm.hex_digest(key.as_bytes()),
        None => key,
    })
}

fn decode(raw: Option<String>) -> Result<Option<Value>> {
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
}

fn decode_hash(raw: HashMap<String, String>) -> Result<HashMap<String, Value>> {
    raw.into_iter()
        .map(|(field, value)| Ok::<_, TetherError>((field, serde_json::from_str(&value)?)))
        .collect()
}

/// Redis cache client.
///
/// Values are stored as JSON text; the `_raw` variants skip encoding.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    config: RedisConfig,
}

impl RedisCache {
    /// Connect to the configured Redis server.
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, config })
    }

    /// Wrap an existing connection manager.
    pub fn with_connection(conn: ConnectionManager, config: RedisConfig) -> Self {
        Self { conn, config }
    }

    /// A clone of the underlying connection manager.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// The cache configuration.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Build a cache key using the configured hashing settings.
    pub fn cache_key(&self, payload: &serde_json::Map<String, Value>, separator: &str) -> Result<String> {
        let hash = self.config.hash_keys.then_some(self.config.hash_algorithm);
        build_cache_key(payload, separator, hash)
    }

    fn expire_secs(&self, expire: Option<Duration>) -> u64 {
        expire.unwrap_or(self.config.expire).as_secs().max(1)
    }

    /// Get a JSON value.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        decode(self.get_raw(key).await?)
    }

    /// Get a raw string value.
    pub async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        require("key", key)?;
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    /// Get several JSON values; missing keys yield `None` in their slot.
    pub async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Value>>> {
        self.mget_raw(keys).await?.into_iter().map(decode).collect()
    }

    /// Get several raw string values.
    pub async fn mget_raw(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        Ok(redis::cmd("MGET").arg(keys).query_async(&mut conn).await?)
    }

    /// Store a JSON value with `expire` or the configured default.
    pub async fn set(&self, key: &str, value: &Value, expire: Option<Duration>) -> Result<()> {
        self.set_raw(key, &serde_json::to_string(value)?, expire).await
    }

    /// Store a raw string value.
    pub async fn set_raw(&self, key: &str, value: &str, expire: Option<Duration>) -> Result<()> {
        require("key", key)?;
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(self.expire_secs(expire))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Delete a key. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        require("key", key)?;
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    /// Delete every key matching a glob `pattern`, `batch_size` keys per
    /// `DEL`. Returns the number of keys removed.
    pub async fn delete_many(&self, pattern: &str, batch_size: usize) -> Result<u64> {
        require("pattern", pattern)?;
        if batch_size == 0 {
            return Err(TetherError::InvalidInput("batch_size must be at least 1".to_string()));
        }

        let mut conn = self.conn.clone();
        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter: redis::AsyncIter<String> = conn.scan_match(pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        keys.sort();
        keys.dedup();

        let mut removed = 0u64;
        for chunk in keys.chunks(batch_size) {
            let count: u64 = conn.del(chunk).await?;
            removed += count;
        }

        tracing::debug!(pattern, removed, "Deleted matching keys");
        Ok(removed)
    }

    /// Get one hash field as JSON.
    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<Value>> {
        decode(self.hget_raw(key, field).await?)
    }

    /// Get one hash field as a raw string.
    pub async fn hget_raw(&self, key: &str, field: &str) -> Result<Option<String>> {
        require("key", key)?;
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    /// Get several hash fields as JSON, in field order.
    pub async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<Value>>> {
        self.hmget_raw(key, fields).await?.into_iter().map(decode).collect()
    }

    /// Get several hash fields as raw strings, in field order.
    pub async fn hmget_raw(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>> {
        require("key", key)?;
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        Ok(redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?)
    }

    /// `hmget` over several keys in one round trip.
    pub async fn hmget_many(&self, keys: &[&str], fields: &[&str]) -> Result<Vec<Vec<Option<Value>>>> {
        if keys.is_empty() || fields.is_empty() {
            return Ok(vec![Vec::new(); keys.len()]);
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("HMGET").arg(*key).arg(fields);
        }
        let mut conn = self.conn.clone();
        let raw: Vec<Vec<Option<String>>> = pipe.query_async(&mut conn).await?;
        raw.into_iter()
            .map(|row| row.into_iter().map(decode).collect::<Result<Vec<_>>>())
            .collect()
    }

    /// All fields of a hash as JSON. A missing hash is an empty map.
    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, Value>> {
        decode_hash(self.hgetall_raw(key).await?)
    }

    /// All fields of a hash as raw strings.
    pub async fn hgetall_raw(&self, key: &str) -> Result<HashMap<String, String>> {
        require("key", key)?;
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    /// `hgetall` over several keys in one round trip.
    pub async fn hgetall_many(&self, keys: &[&str]) -> Result<Vec<HashMap<String, Value>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.hgetall(*key);
        }
        let mut conn = self.conn.clone();
        let raw: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;
        raw.into_iter().map(decode_hash).collect()
    }

    /// Set one hash field and refresh the hash's expiry. Returns whether the
    /// field is new.
    pub async fn hset(&self, key: &str, field: &str, value: &Value, expire: Option<Duration>) -> Result<bool> {
        self.hset_raw(key, field, &serde_json::to_string(value)?, expire).await
    }

    /// Set one hash field to a raw string and refresh the hash's expiry.
    pub async fn hset_raw(&self, key: &str, field: &str, value: &str, expire: Option<Duration>) -> Result<bool> {
        require("key", key)?;
        require("field", field)?;
        let mut conn = self.conn.clone();
        let (added,): (u64,) = redis::pipe()
            .atomic()
            .hset(key, field, value)
            .cmd("EXPIRE")
            .arg(key)
            .arg(self.expire_secs(expire))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(added > 0)
    }

    /// Set several hash fields and refresh the hash's expiry.
    pub async fn hmset(&self, key: &str, items: &serde_json::Map<String, Value>, expire: Option<Duration>) -> Result<()> {
        require("key", key)?;
        if items.is_empty() {
            return Ok(());
        }
        let encoded = items
            .iter()
            .map(|(field, value)| Ok::<_, TetherError>((field.as_str(), serde_json::to_string(value)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset_multiple(key, &encoded)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(self.expire_secs(expire))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Delete hash fields. Returns how many existed.
    pub async fn hdel(&self, key: &str, fields: &[&str]) -> Result<u64> {
        require("key", key)?;
        if fields.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        Ok(conn.hdel(key, fields).await?)
    }

    /// Whether a hash field exists.
    pub async fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        require("key", key)?;
        let mut conn = self.conn.clone();
        Ok(conn.hexists(key, field).await?)
    }

    /// Hash holding a job's status.
    pub fn status_key(&self, job_id: &JobId) -> String {
        format!("{}:status:{}", self.config.namespace, job_id)
    }

    /// Key holding a cached job result.
    pub fn result_key(&self, params_key: &str) -> String {
        format!("{}:result:{}", self.config.namespace, params_key)
    }
}

/// Job status lives in a hash per job (`state`, `result`); cached results are
/// plain JSON keys. Both expire after `result_expire`.
#[async_trait]
impl ResultStore for RedisCache {
    async fn record_queued(&self, job_id: &JobId) -> Result<()> {
        require("job_id", job_id.as_str())?;
        let key = self.status_key(job_id);
        let state = serde_json::to_string(&JobState::Queued)?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .del(&key)
            .ignore()
            .hset(&key, "state", state)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.expire_secs(Some(self.config.result_expire)))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn record_done(&self, result: &WorkResult) -> Result<()> {
        let mut items = serde_json::Map::new();
        items.insert("state".to_string(), serde_json::to_value(JobState::Done)?);
        items.insert("result".to_string(), serde_json::to_value(result)?);
        self.hmset(&self.status_key(&result.job_id), &items, Some(self.config.result_expire))
            .await
    }

    async fn status(&self, job_id: &JobId) -> Result<Option<JobStatus>> {
        require("job_id", job_id.as_str())?;
        let key = self.status_key(job_id);
        let mut fields = self.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let state: JobState = fields
            .remove("state")
            .map(serde_json::from_value)
            .transpose()?
            .ok_or_else(|| TetherError::Cache(format!("status hash {key} has no state")))?;
        let result = fields.remove("result").map(serde_json::from_value).transpose()?;
        Ok(Some(JobStatus {
            job_id: job_id.clone(),
            state,
            result,
        }))
    }

    async fn cached_result(&self, key: &str) -> Result<Option<Value>> {
        self.get(&self.result_key(key)).await
    }

    async fn cache_result(&self, key: &str, value: &Value) -> Result<()> {
        require("params_key", key)?;
        self.set(&self.result_key(key), value, Some(self.config.result_expire))
            .await
    }
}
