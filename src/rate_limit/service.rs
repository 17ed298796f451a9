use super::bucket::TokenBucket;
use super::local::MemoryStore;
use super::redis::{RedisStore, RedisStoreConfig};
use super::registry::BucketRegistry;
use super::store::StateStore;
use super::types::{RateSignal, SignalHeaders};
use crate::config::{RateLimitSettings, RedisSettings};
use crate::error::Result;
use http::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Entry point of the limiter: reads redirect signals and hands out buckets.
///
/// Owns the bucket registry, and through it the shared state store and the
/// background sweep. Built once at startup and torn down with [`shutdown`].
///
/// [`shutdown`]: RateLimitService::shutdown
pub struct RateLimitService {
    registry: Arc<BucketRegistry>,
    headers: SignalHeaders,
    max_body_bytes: usize,
}

impl RateLimitService {
    /// Create a service over an existing registry
    pub fn new(registry: Arc<BucketRegistry>, headers: SignalHeaders) -> Self {
        Self {
            registry,
            headers,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Cap the request body buffered for replay on the redirect pass
    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Create a service keeping bucket state in process memory
    pub fn local_only(settings: &RateLimitSettings) -> Result<Self> {
        info!("Initializing bandwidth limiter with in-memory state");
        let headers = settings.signal_headers()?;
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        Ok(Self::new(
            BucketRegistry::with_sweeper(store, settings.burst_multiplier),
            headers,
        )
        .with_max_body_bytes(settings.max_request_body_bytes))
    }

    /// Create a service sharing bucket state through Redis.
    ///
    /// An unreachable Redis does not fail startup; new buckets start with a full burst
    /// until its health check succeeds.
    pub async fn with_redis(settings: &RateLimitSettings, redis: &RedisSettings) -> Result<Self> {
        info!(address = %redis.address, "Initializing bandwidth limiter with Redis state");
        let headers = settings.signal_headers()?;

        let config = RedisStoreConfig {
            url: redis.address.clone(),
            key_prefix: redis.key_prefix.clone(),
            connect_timeout: Duration::from_secs(redis.connect_timeout_secs),
            ..Default::default()
        };
        let store: Arc<dyn StateStore> = Arc::new(RedisStore::connect(config).await?);

        Ok(Self::new(
            BucketRegistry::with_sweeper(store, settings.burst_multiplier),
            headers,
        )
        .with_max_body_bytes(settings.max_request_body_bytes))
    }

    /// Create the service the settings ask for
    pub async fn from_settings(settings: &RateLimitSettings) -> Result<Self> {
        match &settings.redis {
            Some(redis) => Self::with_redis(settings, redis).await,
            None => Self::local_only(settings),
        }
    }

    /// Read a redirect signal from downstream response headers
    pub fn signal(&self, headers: &HeaderMap) -> Option<RateSignal> {
        RateSignal::from_headers(headers, &self.headers)
    }

    /// Bucket a redirect is limited by, when the signal names a user and a usable rate
    pub async fn bucket_for(&self, signal: &RateSignal) -> Option<Arc<TokenBucket>> {
        let (user_id, rate) = signal.limit()?;
        let bucket = self.registry.get_or_create(user_id, rate).await;
        debug!(user_id, rate, redirect = %signal.redirect_path, "Attached token bucket");
        Some(bucket)
    }

    pub fn registry(&self) -> &Arc<BucketRegistry> {
        &self.registry
    }

    pub fn signal_headers(&self) -> &SignalHeaders {
        &self.headers
    }

    /// Largest request body the redirect pass will replay
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Whether the shared state store is serving; limiting is disabled while it is not
    pub fn is_store_healthy(&self) -> bool {
        self.registry.store().is_healthy()
    }

    /// Stop background work, drop all buckets and close the store
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
