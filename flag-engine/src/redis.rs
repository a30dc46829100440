use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("Not found in redis")]
    NotFound,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Timeout error")]
    Timeout,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(Arc::new(err))
        }
    }
}

impl From<tokio::time::error::Elapsed> for CustomRedisError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CustomRedisError::Timeout
    }
}

/// The subset of redis commands the evaluation cache needs.
/// `get` returns `CustomRedisError::NotFound` for a missing key, never an empty value.
#[async_trait]
pub trait Client {
    async fn get(&self, k: String) -> Result<String, CustomRedisError>;
    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CustomRedisError>;
    async fn del(&self, k: String) -> Result<(), CustomRedisError>;
    /// Deletes every key starting with `prefix`. Returns how many keys were removed.
    async fn del_prefix(&self, prefix: String) -> Result<u64, CustomRedisError>;
}

/// Escapes glob metacharacters so `prefix` matches literally in a `SCAN MATCH` pattern.
pub fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

pub struct RedisClient {
    connection: MultiplexedConnection,
    command_timeout: Duration,
}

impl RedisClient {
    pub async fn new(addr: String, command_timeout: Duration) -> Result<RedisClient, CustomRedisError> {
        if command_timeout.is_zero() {
            return Err(CustomRedisError::InvalidConfiguration(
                "redis command timeout cannot be zero".to_string(),
            ));
        }

        let client = redis::Client::open(addr)?;
        let connection = timeout(command_timeout, client.get_multiplexed_tokio_connection()).await??;

        Ok(RedisClient {
            connection,
            command_timeout,
        })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = timeout(self.command_timeout, conn.get(k)).await??;

        value.ok_or(CustomRedisError::NotFound)
    }

    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CustomRedisError> {
        let seconds = usize::try_from(seconds)
            .map_err(|_| CustomRedisError::InvalidConfiguration(format!("ttl {seconds}s")))?;

        let mut conn = self.connection.clone();
        timeout(self.command_timeout, conn.set_ex::<_, _, ()>(k, v, seconds)).await??;
        Ok(())
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        timeout(self.command_timeout, conn.del::<_, ()>(k)).await??;
        Ok(())
    }

    async fn del_prefix(&self, prefix: String) -> Result<u64, CustomRedisError> {
        let mut conn = self.connection.clone();
        let pattern = prefix_pattern(&prefix);

        let keys = timeout(self.command_timeout, async {
            let mut keys: Vec<String> = Vec::new();
            let mut iter = conn.scan_match::<_, String>(pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            Ok::<_, redis::RedisError>(keys)
        })
        .await??;

        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let removed = timeout(self.command_timeout, conn.del::<_, u64>(keys)).await??;
        Ok(removed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRedisValue {
    None,
    String(String),
    StringWithTTL(String, u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRedisCall {
    pub op: String,
    pub key: String,
    pub value: MockRedisValue,
}

/// In-memory stand-in for redis. Values written with `setex` are readable with `get`
/// (expiry is recorded, not enforced), and every call is recorded for assertions.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    store: Arc<Mutex<HashMap<String, String>>>,
    get_err: Arc<Mutex<Option<CustomRedisError>>>,
    set_err: Arc<Mutex<Option<CustomRedisError>>>,
    del_err: Arc<Mutex<Option<CustomRedisError>>>,
    calls: Arc<Mutex<Vec<MockRedisCall>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_err(&self, err: Option<CustomRedisError>) -> Self {
        *lock(&self.get_err) = err;
        self.clone()
    }

    pub fn set_err(&self, err: Option<CustomRedisError>) -> Self {
        *lock(&self.set_err) = err;
        self.clone()
    }

    pub fn del_err(&self, err: Option<CustomRedisError>) -> Self {
        *lock(&self.del_err) = err;
        self.clone()
    }

    /// Seeds a raw value, bypassing call recording.
    pub fn insert_raw(&self, key: &str, value: &str) {
        lock(&self.store).insert(key.to_owned(), value.to_owned());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        lock(&self.store).contains_key(key)
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, op: &str) -> Vec<MockRedisCall> {
        self.get_calls().into_iter().filter(|c| c.op == op).collect()
    }

    fn record(&self, op: &str, key: &str, value: MockRedisValue) {
        lock(&self.calls).push(MockRedisCall {
            op: op.to_string(),
            key: key.to_string(),
            value,
        });
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, key: String) -> Result<String, CustomRedisError> {
        self.record("get", &key, MockRedisValue::None);

        if let Some(err) = lock(&self.get_err).clone() {
            return Err(err);
        }
        lock(&self.store)
            .get(&key)
            .cloned()
            .ok_or(CustomRedisError::NotFound)
    }

    async fn setex(&self, key: String, value: String, seconds: u64) -> Result<(), CustomRedisError> {
        self.record(
            "setex",
            &key,
            MockRedisValue::StringWithTTL(value.clone(), seconds),
        );

        if let Some(err) = lock(&self.set_err).clone() {
            return Err(err);
        }
        lock(&self.store).insert(key, value);
        Ok(())
    }

    async fn del(&self, key: String) -> Result<(), CustomRedisError> {
        self.record("del", &key, MockRedisValue::None);

        if let Some(err) = lock(&self.del_err).clone() {
            return Err(err);
        }
        lock(&self.store).remove(&key);
        Ok(())
    }

    async fn del_prefix(&self, prefix: String) -> Result<u64, CustomRedisError> {
        self.record("del_prefix", &prefix, MockRedisValue::None);

        if let Some(err) = lock(&self.del_err).clone() {
            return Err(err);
        }
        let mut store = lock(&self.store);
        let before = store.len();
        store.retain(|k, _| !k.starts_with(&prefix));
        Ok((before - store.len()) as u64)
    }
}
