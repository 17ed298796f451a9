use super::bucket::TokenBucket;
use super::store::StateStore;
use super::task::BackgroundTask;
use super::types::{IDLE_EXPIRY, SWEEP_INTERVAL};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

type BucketMap = HashMap<String, Arc<TokenBucket>>;

/// Process-wide set of token buckets, one per user id.
///
/// Lookups take the read lock. Creation re-checks under the write lock so that
/// concurrent first requests for a user end up sharing one bucket.
pub struct BucketRegistry {
    buckets: Arc<RwLock<BucketMap>>,
    store: Arc<dyn StateStore>,
    burst_multiplier: f64,
    sweeper: Mutex<Option<BackgroundTask>>,
}

impl BucketRegistry {
    /// Create a registry without a running sweep
    pub fn new(store: Arc<dyn StateStore>, burst_multiplier: f64) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            store,
            burst_multiplier,
            sweeper: Mutex::new(None),
        }
    }

    /// Create a registry and start the default idle sweep
    pub fn with_sweeper(store: Arc<dyn StateStore>, burst_multiplier: f64) -> Arc<Self> {
        let registry = Arc::new(Self::new(store, burst_multiplier));
        registry.start_sweeper(SWEEP_INTERVAL, IDLE_EXPIRY);
        registry
    }

    /// Start the periodic sweep; replaces a sweep that is already running
    pub fn start_sweeper(&self, period: Duration, max_idle: Duration) {
        let buckets = self.buckets.clone();
        let store = self.store.clone();

        let task = BackgroundTask::spawn_periodic("bucket-sweep", period, move || {
            let buckets = buckets.clone();
            let store = store.clone();
            async move {
                sweep(&buckets, store.as_ref(), max_idle).await;
            }
        });

        match self.sweeper.try_lock() {
            Ok(mut slot) => {
                // Dropping a previous task aborts it
                *slot = Some(task);
            }
            Err(_) => warn!("Sweep slot busy, sweep not started"),
        }
    }

    /// Fetch the bucket for a user, creating it on first use.
    ///
    /// An existing bucket whose rate differs is updated in place. A new bucket is
    /// seeded from the store when it holds state for the user; when two callers race
    /// to create the same user, the loser's restored state is dropped.
    pub async fn get_or_create(&self, user_id: &str, rate: u64) -> Arc<TokenBucket> {
        let existing = self.buckets.read().await.get(user_id).cloned();
        if let Some(bucket) = existing {
            update_rate(&bucket, rate).await;
            return bucket;
        }

        // Store I/O happens before the write lock so a slow store never stalls other users
        let restored =
            TokenBucket::restore(user_id, rate, self.burst_multiplier, self.store.clone()).await;

        let mut buckets = self.buckets.write().await;

        if let Some(bucket) = buckets.get(user_id).cloned() {
            drop(buckets);
            update_rate(&bucket, rate).await;
            return bucket;
        }

        let bucket = Arc::new(restored);
        buckets.insert(user_id.to_string(), bucket.clone());
        crate::metrics::record_active_buckets(buckets.len());

        bucket
    }

    /// Fetch the bucket for a user without creating it
    pub async fn get(&self, user_id: &str) -> Option<Arc<TokenBucket>> {
        self.buckets.read().await.get(user_id).cloned()
    }

    /// Number of live buckets
    pub async fn len(&self) -> usize {
        self.buckets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.read().await.is_empty()
    }

    /// Evict buckets idle for longer than `max_idle`, returning how many were removed
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        sweep(&self.buckets, self.store.as_ref(), max_idle).await
    }

    /// The store backing this registry
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn burst_multiplier(&self) -> f64 {
        self.burst_multiplier
    }

    /// Stop the sweep, drop every bucket and close the store
    pub async fn shutdown(&self) {
        if let Some(mut task) = self.sweeper.lock().await.take() {
            task.shutdown().await;
        }

        let dropped = {
            let mut buckets = self.buckets.write().await;
            let count = buckets.len();
            buckets.clear();
            count
        };
        crate::metrics::record_active_buckets(0);

        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Failed to close rate limit store");
        }

        info!(buckets = dropped, "Bucket registry shut down");
    }
}

async fn update_rate(bucket: &TokenBucket, rate: u64) {
    let old_rate = bucket.rate().await;
    if old_rate != rate {
        bucket.set_rate(rate).await;
        debug!(
            user_id = bucket.user_id(),
            old_rate,
            new_rate = rate,
            "Updated token bucket rate"
        );
    }
}

async fn sweep(buckets: &RwLock<BucketMap>, store: &dyn StateStore, max_idle: Duration) -> usize {
    let now = SystemTime::now();

    let evicted = {
        let mut buckets = buckets.write().await;

        let mut idle = Vec::new();
        for (user_id, bucket) in buckets.iter() {
            let last_access = bucket.last_access().await;
            if now
                .duration_since(last_access)
                .map(|elapsed| elapsed > max_idle)
                .unwrap_or(false)
            {
                idle.push(user_id.clone());
            }
        }

        for user_id in &idle {
            buckets.remove(user_id);
            debug!(user_id = %user_id, "Evicted idle token bucket");
        }

        crate::metrics::record_active_buckets(buckets.len());
        idle
    };

    if !store.has_native_expiry() {
        for user_id in &evicted {
            if let Err(e) = store.delete(user_id).await {
                warn!(user_id = %user_id, error = %e, "Failed to delete swept bucket state");
            }
        }
    }

    if !evicted.is_empty() {
        info!(evicted = evicted.len(), "Swept idle token buckets");
    }

    evicted.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::local::MemoryStore;
    use crate::rate_limit::types::{BucketState, StoreResult};
    use std::time::Instant;

    fn memory_registry() -> (BucketRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let registry = BucketRegistry::new(store.clone(), 1.0);
        (registry, store)
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_bucket() {
        let (registry, _store) = memory_registry();

        let first = registry.get_or_create("u1", 1024).await;
        let second = registry.get_or_create("u1", 1024).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);
        assert!(registry.get("u2").await.is_none());
    }

    #[tokio::test]
    async fn test_rate_change_updates_in_place() {
        let (registry, _store) = memory_registry();

        let first = registry.get_or_create("u1", 1024).await;
        let second = registry.get_or_create("u1", 4096).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.rate().await, 4096);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_requests_share_one_bucket() {
        let (registry, _store) = memory_registry();
        let registry = Arc::new(registry);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create("same-user", 2048).await
            }));
        }

        let mut buckets = Vec::new();
        for handle in handles {
            buckets.push(handle.await.unwrap());
        }

        assert_eq!(registry.len().await, 1);
        assert!(buckets.iter().all(|b| Arc::ptr_eq(b, &buckets[0])));
    }

    /// Memory store whose reads take a while
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl StateStore for SlowStore {
        async fn get(&self, user_id: &str) -> StoreResult<Option<BucketState>> {
            tokio::time::sleep(self.delay).await;
            self.inner.get(user_id).await
        }

        async fn set(&self, user_id: &str, state: BucketState) -> StoreResult<()> {
            self.inner.set(user_id, state).await
        }

        async fn delete(&self, user_id: &str) -> StoreResult<()> {
            self.inner.delete(user_id).await
        }

        async fn close(&self) -> StoreResult<()> {
            self.inner.close().await
        }

        fn has_native_expiry(&self) -> bool {
            false
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_store_read_does_not_block_other_users() {
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(300),
        });
        let registry = Arc::new(BucketRegistry::new(store, 1.0));
        let existing = registry.get_or_create("existing", 1024).await;

        let creating = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create("newcomer", 1024).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = Instant::now();
        let found = registry.get_or_create("existing", 1024).await;
        assert!(Arc::ptr_eq(&existing, &found));
        assert!(registry.get("existing").await.is_some());
        assert!(
            start.elapsed() < Duration::from_millis(100),
            "lookup waited {:?}",
            start.elapsed()
        );

        creating.await.unwrap();
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_creators_with_slow_store_share_one_bucket() {
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(50),
        });
        let registry = Arc::new(BucketRegistry::new(store, 1.0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create("racer", 4096).await
            }));
        }

        let mut buckets = Vec::new();
        for handle in handles {
            buckets.push(handle.await.unwrap());
        }

        assert_eq!(registry.len().await, 1);
        assert!(buckets.iter().all(|b| Arc::ptr_eq(b, &buckets[0])));
    }

    #[tokio::test]
    async fn test_new_bucket_is_seeded_from_store() {
        let (registry, store) = memory_registry();
        store
            .set("u1", BucketState::new(512.0, SystemTime::now()))
            .await
            .unwrap();

        let bucket = registry.get_or_create("u1", 1024).await;
        assert_eq!(bucket.tokens().await, 512.0);
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_buckets_and_local_state() {
        let (registry, store) = memory_registry();

        let bucket = registry.get_or_create("u2", 1024).await;
        bucket.allow(0).await;
        store
            .set("u2", BucketState::new(100.0, SystemTime::now()))
            .await
            .unwrap();

        // Nothing is idle against the production threshold
        assert_eq!(registry.sweep_idle(IDLE_EXPIRY).await, 0);
        assert_eq!(registry.len().await, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.sweep_idle(Duration::from_millis(5)).await, 1);
        assert!(registry.is_empty().await);
        assert_eq!(store.get("u2").await.unwrap(), None);

        // A returning user starts from an empty bucket
        let fresh = registry.get_or_create("u2", 1024).await;
        assert!(!Arc::ptr_eq(&bucket, &fresh));
        assert_eq!(fresh.tokens().await, 0.0);
    }

    #[tokio::test]
    async fn test_background_sweep() {
        let store = Arc::new(MemoryStore::new());
        let registry = BucketRegistry::new(store, 1.0);
        registry.get_or_create("idle-user", 1024).await;

        registry.start_sweeper(Duration::from_millis(20), Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(registry.is_empty().await);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_clears_buckets_and_store() {
        let (registry, store) = memory_registry();
        registry.get_or_create("a", 10).await;
        store
            .set("a", BucketState::new(1.0, SystemTime::now()))
            .await
            .unwrap();

        registry.shutdown().await;

        assert!(registry.is_empty().await);
        assert!(store.is_empty());
    }
}
