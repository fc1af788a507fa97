//! Redis list-backed job source.
//!
//! Producers push JSON entries onto a pending list. Fetching moves entries to
//! a processing list and records their start time in a sorted set, all inside
//! one script so a crash can never lose an entry between the two. Entries are
//! removed from both on acknowledgment; `recover` moves entries that have
//! been processing for too long back to the pending list.
//!
//! A fetched entry is stored as `<delivery>:<entry>`, where `<delivery>` is a
//! per-list counter. Two identical payloads in flight therefore stay distinct
//! in both the processing list and the start-time set.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

use super::redis::RedisCache;
use crate::config::{RedisConfig, SourceKind};
use crate::error::{require, Result, TetherError};
use crate::job::{assign_id, Job, JobBody, JobId};
use crate::source::{receipt_of, JobSource};

const FETCH_SCRIPT: &str = r"
local moved = {}
for i = 1, tonumber(ARGV[2]) do
  local entry = redis.call('RPOP', KEYS[1])
  if not entry then break end
  local tagged = redis.call('INCR', KEYS[4]) .. ':' .. entry
  redis.call('LPUSH', KEYS[2], tagged)
  redis.call('ZADD', KEYS[3], ARGV[1], tagged)
  moved[#moved + 1] = tagged
end
return moved
";

const RECOVER_SCRIPT: &str = r"
local stale = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
local moved = 0
for _, tagged in ipairs(stale) do
  if redis.call('LREM', KEYS[2], 1, tagged) > 0 then
    local sep = string.find(tagged, ':', 1, true)
    redis.call('LPUSH', KEYS[1], string.sub(tagged, sep + 1))
    moved = moved + 1
  end
  redis.call('ZREM', KEYS[3], tagged)
end
return moved
";

/// Split a processing entry into its delivery number and the original entry.
fn untag(tagged: &str) -> Option<(u64, &str)> {
    let (delivery, entry) = tagged.split_once(':')?;
    Some((delivery.parse().ok()?, entry))
}

/// Redis keys of one job list, under a namespace prefix.
#[derive(Debug, Clone)]
pub struct ListKeys {
    namespace: String,
    list: String,
}

impl ListKeys {
    /// Keys for `list` under `namespace`.
    pub fn new(namespace: impl Into<String>, list: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            list: list.into(),
        }
    }

    /// The list name.
    pub fn list(&self) -> &str {
        &self.list
    }

    /// Jobs waiting to be fetched (LIST). Producers push left, workers pop right.
    pub fn pending(&self) -> String {
        format!("{}:{}:pending", self.namespace, self.list)
    }

    /// Jobs fetched but not yet acknowledged (LIST).
    pub fn processing(&self) -> String {
        format!("{}:{}:processing", self.namespace, self.list)
    }

    /// Fetch time of each processing entry (ZSET, score in Unix milliseconds).
    pub fn started(&self) -> String {
        format!("{}:{}:started", self.namespace, self.list)
    }

    /// Delivery counter used to tag processing entries (STRING).
    pub fn deliveries(&self) -> String {
        format!("{}:{}:deliveries", self.namespace, self.list)
    }
}

/// Job source over a Redis list.
#[derive(Clone)]
pub struct RedisListSource {
    conn: ConnectionManager,
    keys: ListKeys,
    fetch: redis::Script,
    recover: redis::Script,
}

impl RedisListSource {
    /// Create a source with an existing connection manager.
    pub fn with_connection(conn: ConnectionManager, namespace: &str, list: &str) -> Result<Self> {
        require("list", list)?;
        Ok(Self {
            conn,
            keys: ListKeys::new(namespace, list),
            fetch: redis::Script::new(FETCH_SCRIPT),
            recover: redis::Script::new(RECOVER_SCRIPT),
        })
    }

    /// Connect to Redis and consume `list` under the configured namespace.
    pub async fn connect(config: &RedisConfig, list: &str) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Self::with_connection(conn, &config.namespace, list)
    }

    /// Share the connection of an existing cache client.
    pub fn from_cache(cache: &RedisCache, list: &str) -> Result<Self> {
        Self::with_connection(cache.connection(), &cache.config().namespace, list)
    }

    /// The Redis keys used by this source.
    pub fn keys(&self) -> &ListKeys {
        &self.keys
    }

    /// Number of entries waiting to be fetched.
    pub async fn pending_len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(self.keys.pending()).await?)
    }

    /// Number of entries fetched but not acknowledged.
    pub async fn processing_len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(self.keys.processing()).await?)
    }

    async fn remove_entry(&self, entry: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let (removed,): (u64,) = redis::pipe()
            .atomic()
            .lrem(self.keys.processing(), 1, entry)
            .zrem(self.keys.started(), entry)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl JobSource for RedisListSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Cache
    }

    fn name(&self) -> &str {
        self.keys.list()
    }

    async fn fetch_batch(&self, max: usize) -> Result<Vec<Job>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let entries: Vec<String> = self
            .fetch
            .key(self.keys.pending())
            .key(self.keys.processing())
            .key(self.keys.started())
            .key(self.keys.deliveries())
            .arg(chrono::Utc::now().timestamp_millis())
            .arg(max)
            .invoke_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(entries.len());
        for tagged in entries {
            let parsed = match untag(&tagged) {
                Some((_, entry)) => Job::from_json(entry),
                None => Err(TetherError::Cache(format!("untagged processing entry {tagged}"))),
            };
            match parsed {
                Ok(job) => jobs.push(job.with_receipt(tagged)),
                Err(e) => {
                    tracing::error!(list = %self.keys.list(), error = %e, "Dropping malformed job entry");
                    if let Err(e) = self.remove_entry(&tagged).await {
                        tracing::warn!(list = %self.keys.list(), error = %e, "Failed to drop malformed entry");
                    }
                }
            }
        }
        Ok(jobs)
    }

    async fn acknowledge(&self, job: &Job) -> Result<()> {
        let entry = receipt_of(job)?;
        if !self.remove_entry(entry).await? {
            tracing::debug!(job_id = %job.id, "Acknowledged job was no longer processing");
        }
        Ok(())
    }

    async fn enqueue(&self, body: &JobBody) -> Result<JobId> {
        let mut body = body.clone();
        let id = assign_id(&mut body);
        let entry = serde_json::to_string(&body)?;

        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(self.keys.pending(), entry).await?;
        Ok(id)
    }

    async fn recover(&self, stale_after: Duration) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp_millis() - stale_after.as_millis() as i64;
        let mut conn = self.conn.clone();
        let moved: usize = self
            .recover
            .key(self.keys.pending())
            .key(self.keys.processing())
            .key(self.keys.started())
            .arg(cutoff)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }
}
