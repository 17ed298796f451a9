use super::lua_scripts::{GET_STATE_SCRIPT, PURGE_PREFIX_SCRIPT, SET_STATE_SCRIPT};
use super::store::StateStore;
use super::task::BackgroundTask;
use super::types::{BucketState, StoreError, StoreResult, IDLE_EXPIRY};
use async_trait::async_trait;
use backoff::backoff::{Backoff, Constant};
use redis::{aio::ConnectionManager, RedisResult, Script};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Redis store settings
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// `redis://` URL or bare `host:port`
    pub url: String,
    /// Namespace prepended to every user id
    pub key_prefix: String,
    /// Expiry re-armed on every write
    pub ttl: Duration,
    /// Timeout for connecting and for health checks
    pub connect_timeout: Duration,
    /// Timeout for one attempt of a store operation
    pub op_timeout: Duration,
    /// Attempts per operation before giving up
    pub max_attempts: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
    /// Interval of the background health check
    pub health_interval: Duration,
}

impl RedisStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "ratelimit:".to_string(),
            ttl: IDLE_EXPIRY,
            connect_timeout: Duration::from_secs(5),
            op_timeout: Duration::from_millis(500),
            max_attempts: 3,
            retry_delay: Duration::from_millis(50),
            health_interval: Duration::from_secs(30),
        }
    }
}

/// Redis-backed shared state store.
///
/// State is shared by every instance pointing at the same Redis, and reads and
/// writes go through Lua scripts so each executes atomically on the server. While
/// the store is unhealthy it fails open: reads report an unlimited balance and
/// writes are skipped.
pub struct RedisStore {
    inner: Arc<RedisInner>,
    health_task: Mutex<Option<BackgroundTask>>,
}

struct RedisInner {
    client: redis::Client,
    connection: RwLock<Option<ConnectionManager>>,
    healthy: AtomicBool,
    config: RedisStoreConfig,
    get_script: Script,
    set_script: Script,
    purge_script: Script,
}

impl RedisStore {
    /// Connect to Redis and start the health check.
    ///
    /// An unreachable server is not an error: the store starts unhealthy and the
    /// health check keeps trying. Only an unparseable address fails.
    pub async fn connect(config: RedisStoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(normalize_url(&config.url))?;

        let inner = Arc::new(RedisInner {
            client,
            connection: RwLock::new(None),
            healthy: AtomicBool::new(false),
            config,
            get_script: Script::new(GET_STATE_SCRIPT),
            set_script: Script::new(SET_STATE_SCRIPT),
            purge_script: Script::new(PURGE_PREFIX_SCRIPT),
        });

        match inner.ping().await {
            Ok(()) => {
                inner.healthy.store(true, Ordering::SeqCst);
                info!(url = %inner.config.url, "Redis connection successful");
            }
            Err(e) => {
                warn!(
                    url = %inner.config.url,
                    error = %e,
                    "Redis connection failed, bucket state is not shared until it recovers"
                );
            }
        }
        crate::metrics::record_store_health(inner.healthy.load(Ordering::SeqCst));

        let check_inner = inner.clone();
        let task = BackgroundTask::spawn_periodic(
            "redis-health",
            inner.config.health_interval,
            move || {
                let inner = check_inner.clone();
                async move {
                    inner.check().await;
                }
            },
        );

        Ok(Self {
            inner,
            health_task: Mutex::new(Some(task)),
        })
    }

    /// Run a health check now
    pub async fn check_health(&self) -> bool {
        self.inner.check().await
    }

    fn key(&self, user_id: &str) -> String {
        format!("{}{}", self.inner.config.key_prefix, user_id)
    }

    /// Run one store operation on the shared connection under the retry policy
    async fn with_retry<T, F, Fut>(&self, op: &'static str, attempt_fn: F) -> StoreResult<T>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let inner = self.inner.as_ref();
        let attempt_fn = &attempt_fn;

        inner
            .retry(op, move || async move {
                let connection = inner.connection().await?;
                Ok::<T, StoreError>(attempt_fn(connection).await?)
            })
            .await
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, user_id: &str) -> StoreResult<Option<BucketState>> {
        if !self.is_healthy() {
            return Ok(Some(BucketState::unlimited()));
        }

        let key = self.key(user_id);
        let script = &self.inner.get_script;

        let raw = self
            .with_retry("get", |mut connection| {
                let key = key.clone();
                async move {
                    script
                        .key(&key)
                        .invoke_async::<_, Option<(String, String)>>(&mut connection)
                        .await
                }
            })
            .await;

        let (tokens, last_access) = match raw {
            Ok(Some(values)) => values,
            Ok(None) => return Ok(None),
            Err(_) => return Ok(Some(BucketState::unlimited())),
        };

        match parse_state(&tokens, &last_access) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                error!(key = %key, error = %e, "Stored bucket state is malformed");
                Ok(Some(BucketState::unlimited()))
            }
        }
    }

    async fn set(&self, user_id: &str, state: BucketState) -> StoreResult<()> {
        if !self.is_healthy() {
            return Ok(());
        }

        let key = self.key(user_id);
        let script = &self.inner.set_script;
        let ttl_secs = self.inner.config.ttl.as_secs().max(1);
        let last_access = state.last_access_nanos();

        self.with_retry("set", |mut connection| {
            let key = key.clone();
            async move {
                script
                    .key(&key)
                    .arg(state.tokens)
                    .arg(last_access)
                    .arg(ttl_secs)
                    .invoke_async::<_, i64>(&mut connection)
                    .await
            }
        })
        .await
        .map(|_| ())
    }

    async fn delete(&self, user_id: &str) -> StoreResult<()> {
        if !self.is_healthy() {
            return Ok(());
        }

        let key = self.key(user_id);

        self.with_retry("delete", |mut connection| {
            let key = key.clone();
            async move {
                redis::cmd("DEL")
                    .arg(&key)
                    .query_async::<_, i64>(&mut connection)
                    .await
            }
        })
        .await
        .map(|_| ())
    }

    async fn close(&self) -> StoreResult<()> {
        if let Some(mut task) = self.health_task.lock().await.take() {
            task.shutdown().await;
        }

        if self.is_healthy() {
            if let Ok(mut connection) = self.inner.connection().await {
                let pattern = format!("{}*", self.inner.config.key_prefix);
                let mut invocation = self.inner.purge_script.prepare_invoke();
                invocation.arg(&pattern);
                let purge = invocation.invoke_async::<_, i64>(&mut connection);

                match timeout(self.inner.config.connect_timeout, purge).await {
                    Ok(Ok(deleted)) => info!(deleted, "Purged rate limit keys from Redis"),
                    Ok(Err(e)) => warn!(error = %e, "Failed to purge rate limit keys"),
                    Err(_) => warn!("Timed out purging rate limit keys"),
                }
            }
        }

        *self.inner.connection.write().await = None;
        self.inner.healthy.store(false, Ordering::SeqCst);

        Ok(())
    }

    fn has_native_expiry(&self) -> bool {
        true
    }

    fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::SeqCst)
    }
}

impl RedisInner {
    /// Retry an operation with a constant backoff; each attempt is bounded by the op
    /// timeout. Running out of attempts marks the store unhealthy so later calls fail
    /// open straight away until the health check succeeds.
    async fn retry<T, F, Fut>(&self, op: &'static str, mut attempt_fn: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut backoff = Constant::new(self.config.retry_delay);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match timeout(self.config.op_timeout, attempt_fn()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => StoreError::Timeout(op),
            };

            if attempt >= self.config.max_attempts {
                error!(op, attempt, error = %err, "Redis operation failed after all retries");
                crate::metrics::record_store_failure(op);
                self.set_health(false);
                return Err(err);
            }

            let wait = backoff.next_backoff().unwrap_or(self.config.retry_delay);
            warn!(
                op,
                attempt,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "Redis operation failed, retrying"
            );
            tokio::time::sleep(wait).await;
        }
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        if let Some(connection) = self.connection.read().await.as_ref() {
            return Ok(connection.clone());
        }
        Err(StoreError::NotConnected)
    }

    async fn ensure_connection(&self) -> StoreResult<ConnectionManager> {
        if let Ok(connection) = self.connection().await {
            return Ok(connection);
        }

        let mut slot = self.connection.write().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }

        let connection = timeout(
            self.config.connect_timeout,
            ConnectionManager::new(self.client.clone()),
        )
        .await
        .map_err(|_| StoreError::Timeout("connect"))??;

        debug!(url = %self.config.url, "Opened Redis connection");
        *slot = Some(connection.clone());
        Ok(connection)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut connection = self.ensure_connection().await?;
        timeout(
            self.config.connect_timeout,
            redis::cmd("PING").query_async::<_, String>(&mut connection),
        )
        .await
        .map_err(|_| StoreError::Timeout("ping"))??;
        Ok(())
    }

    async fn check(&self) -> bool {
        match self.ping().await {
            Ok(()) => {
                self.set_health(true);
                true
            }
            Err(e) => {
                debug!(error = %e, "Redis health check failed");
                self.set_health(false);
                false
            }
        }
    }

    fn set_health(&self, healthy: bool) {
        let was_healthy = self.healthy.swap(healthy, Ordering::SeqCst);

        if was_healthy && !healthy {
            warn!(url = %self.config.url, "Redis unavailable, new buckets start full and state is not shared");
        } else if !was_healthy && healthy {
            info!(url = %self.config.url, "Redis connection restored");
        }

        crate::metrics::record_store_health(healthy);
    }
}

/// Accept bare `host:port` addresses as well as URLs
fn normalize_url(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("redis://{}", address)
    }
}

fn parse_state(tokens: &str, last_access: &str) -> StoreResult<BucketState> {
    let tokens = tokens
        .parse::<f64>()
        .map_err(|e| StoreError::Malformed(format!("tokens {:?}: {}", tokens, e)))?;
    let nanos = last_access
        .parse::<i64>()
        .map_err(|e| StoreError::Malformed(format!("lastAccess {:?}: {}", last_access, e)))?;
    Ok(BucketState::from_nanos(tokens, nanos))
}
