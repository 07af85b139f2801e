//! # Shared Store
//!
//! The key/counter store shared by every worker: rate-limit counters and
//! the store-backed recent-error list live here. Every mutation is a single
//! atomic operation against the backend (`INCR`+`EXPIRE` or
//! `LPUSH`+`LTRIM` inside one `MULTI`), never a read-modify-write pair.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::lock;
use crate::types::{Error, ErrorKind};

/// Failures raised by a store backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::new(ErrorKind::Store, err.to_string()).transient().cause(err)
    }
}

/// Minimal shared key/counter store
#[async_trait]
pub trait SharedStore: Send + Sync + fmt::Debug {
    /// Increments the counter at `key` and returns the new value in one
    /// atomic step. The key expires `ttl` after the last increment.
    async fn incr(&self, key: &str, ttl: Duration) -> StoreResult<u64>;

    /// Pushes `value` to the front of the list at `key` and trims the list
    /// to `capacity` entries, atomically.
    async fn push_capped(&self, key: &str, value: String, capacity: usize) -> StoreResult<()>;

    /// Up to `limit` list entries, newest first.
    async fn recent(&self, key: &str, limit: usize) -> StoreResult<Vec<String>>;

    /// Round trip used by health probes.
    async fn ping(&self) -> StoreResult<()>;

    /// Backend name for logs.
    fn backend(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: u64,
    expires_at_ms: i64,
}

/// In-process store for single-instance deployments and tests
#[derive(Debug)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    counters: std::sync::Mutex<HashMap<String, Counter>>,
    lists: std::sync::Mutex<HashMap<String, VecDeque<String>>>,
    last_sweep_secs: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            counters: std::sync::Mutex::new(HashMap::new()),
            lists: std::sync::Mutex::new(HashMap::new()),
            last_sweep_secs: AtomicI64::new(i64::MIN),
        }
    }

    /// Number of live counters, for diagnostics
    pub fn counter_count(&self) -> usize {
        let now_ms = self.clock.now().timestamp_millis();
        lock(&self.counters)
            .values()
            .filter(|c| c.expires_at_ms > now_ms)
            .count()
    }

    // Drops expired counters at most once per second
    fn sweep(&self, counters: &mut HashMap<String, Counter>, now_ms: i64) {
        let now_secs = now_ms.div_euclid(1000);
        let last = self.last_sweep_secs.swap(now_secs, Ordering::Relaxed);
        if last == now_secs {
            return;
        }
        let before = counters.len();
        counters.retain(|_, c| c.expires_at_ms > now_ms);
        let removed = before - counters.len();
        if removed > 0 {
            debug!(removed, "Swept expired counters");
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn incr(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        let now_ms = self.clock.now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        let mut counters = lock(&self.counters);
        self.sweep(&mut counters, now_ms);

        let counter = counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at_ms: now_ms,
        });
        if counter.expires_at_ms <= now_ms {
            counter.value = 0;
        }
        counter.value += 1;
        counter.expires_at_ms = now_ms.saturating_add(ttl_ms);
        Ok(counter.value)
    }

    async fn push_capped(&self, key: &str, value: String, capacity: usize) -> StoreResult<()> {
        let mut lists = lock(&self.lists);
        let list = lists.entry(key.to_string()).or_default();
        list.push_front(value);
        list.truncate(capacity);
        Ok(())
    }

    async fn recent(&self, key: &str, limit: usize) -> StoreResult<Vec<String>> {
        let lists = lock(&self.lists);
        Ok(lists
            .get(key)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// Inclusive end index for the first `len` list items
fn last_index(len: usize) -> Option<isize> {
    match len {
        0 => None,
        len => Some(isize::try_from(len).unwrap_or(isize::MAX) - 1),
    }
}

/// Redis-backed store shared across processes
pub struct RedisStore {
    url: String,
    connection: ConnectionManager,
    timeout: Duration,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connects to Redis; every later call is bounded by `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let connection = match tokio::time::timeout(timeout, ConnectionManager::new(client)).await {
            Ok(connection) => connection?,
            Err(_) => return Err(StoreError::Timeout(timeout)),
        };

        info!(url = %url, "Connected to Redis");

        Ok(Self {
            url: url.to_string(),
            connection,
            timeout,
        })
    }

    async fn bounded<T, F>(&self, call: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn incr(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        let mut connection = self.connection.clone();
        let ttl_secs = usize::try_from(ttl.as_secs().max(1)).unwrap_or(usize::MAX);

        let (count,): (u64,) = self
            .bounded(async move {
                redis::pipe()
                    .atomic()
                    .incr(key, 1u64)
                    .expire(key, ttl_secs)
                    .ignore()
                    .query_async(&mut connection)
                    .await
            })
            .await?;
        Ok(count)
    }

    async fn push_capped(&self, key: &str, value: String, capacity: usize) -> StoreResult<()> {
        let mut connection = self.connection.clone();
        // LTRIM 0 -1 keeps everything, so an empty cap clears the list instead
        let Some(stop) = last_index(capacity) else {
            return self
                .bounded(async move {
                    redis::cmd("DEL")
                        .arg(key)
                        .query_async::<_, ()>(&mut connection)
                        .await
                })
                .await;
        };

        self.bounded(async move {
            redis::pipe()
                .atomic()
                .lpush(key, value)
                .ignore()
                .ltrim(key, 0, stop)
                .ignore()
                .query_async::<_, ()>(&mut connection)
                .await
        })
        .await
    }

    async fn recent(&self, key: &str, limit: usize) -> StoreResult<Vec<String>> {
        let Some(stop) = last_index(limit) else {
            return Ok(Vec::new());
        };
        let mut connection = self.connection.clone();

        self.bounded(async move {
            redis::cmd("LRANGE")
                .arg(key)
                .arg(0)
                .arg(stop)
                .query_async::<_, Vec<String>>(&mut connection)
                .await
        })
        .await
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut connection = self.connection.clone();
        let pong: String = self
            .bounded(async move { redis::cmd("PING").query_async(&mut connection).await })
            .await?;
        if pong.eq_ignore_ascii_case("PONG") {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply: {}", pong)))
        }
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
