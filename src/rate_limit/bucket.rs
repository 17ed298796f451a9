use super::store::StateStore;
use super::types::{BucketState, STORE_SYNC_INTERVAL};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Per-user token bucket measured in bytes.
///
/// Tokens refill continuously at `rate` bytes per second up to
/// `rate * burst_multiplier`. A new bucket starts empty unless it was restored from
/// the shared state store, so the first bytes always wait for real elapsed time.
///
/// The whole refill-check-consume sequence of [`TokenBucket::allow`] runs under the
/// write lock; getters take the read lock.
pub struct TokenBucket {
    user_id: String,
    burst_multiplier: f64,
    store: Option<Arc<dyn StateStore>>,
    state: RwLock<BucketInner>,
}

struct BucketInner {
    rate: u64,
    tokens: f64,
    last_access: SystemTime,
    last_store_sync: Instant,
}

impl TokenBucket {
    /// Create an empty bucket
    pub fn new(
        user_id: impl Into<String>,
        rate: u64,
        burst_multiplier: f64,
        store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        Self::with_state(
            user_id,
            rate,
            burst_multiplier,
            store,
            BucketState::new(0.0, SystemTime::now()),
        )
    }

    /// Create a bucket starting from a known state
    pub fn with_state(
        user_id: impl Into<String>,
        rate: u64,
        burst_multiplier: f64,
        store: Option<Arc<dyn StateStore>>,
        initial: BucketState,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            burst_multiplier,
            store,
            state: RwLock::new(BucketInner {
                rate: rate.max(1),
                tokens: initial.tokens.max(0.0),
                last_access: initial.last_access,
                last_store_sync: Instant::now(),
            }),
        }
    }

    /// Create a bucket seeded from the store when it holds state for this user
    pub async fn restore(
        user_id: impl Into<String>,
        rate: u64,
        burst_multiplier: f64,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let user_id = user_id.into();

        let initial = match store.get(&user_id).await {
            Ok(Some(state)) => {
                debug!(user_id = %user_id, tokens = state.tokens, "Restored bucket state from store");
                state
            }
            Ok(None) => BucketState::new(0.0, SystemTime::now()),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to read bucket state, starting empty");
                BucketState::new(0.0, SystemTime::now())
            }
        };

        let bucket = Self::with_state(user_id, rate, burst_multiplier, Some(store), initial);

        debug!(
            user_id = %bucket.user_id,
            rate,
            burst_multiplier,
            "Created token bucket"
        );

        bucket
    }

    /// Try to take `count` tokens without waiting
    pub async fn allow(&self, count: u64) -> bool {
        self.allow_at(count, SystemTime::now()).await
    }

    pub(crate) async fn allow_at(&self, count: u64, now: SystemTime) -> bool {
        let persist = {
            let mut inner = self.state.write().await;

            let elapsed = now
                .duration_since(inner.last_access)
                .unwrap_or_default()
                .as_secs_f64();
            inner.last_access = now;

            let new_tokens = inner.rate as f64 * elapsed;
            let max_tokens = self.capacity_for(inner.rate);
            inner.tokens = (inner.tokens + new_tokens).min(max_tokens).max(0.0);

            let requested = count as f64;
            let fifth = inner.rate as f64 / 5.0;
            if new_tokens > fifth || requested > fifth || inner.tokens < requested {
                debug!(
                    user_id = %self.user_id,
                    elapsed,
                    new_tokens,
                    total_tokens = inner.tokens,
                    requested_count = count,
                    max_tokens,
                    "Token state"
                );
            }

            if inner.tokens < requested {
                return false;
            }

            inner.tokens -= requested;

            if self.store.is_some() && inner.last_store_sync.elapsed() > STORE_SYNC_INTERVAL {
                inner.last_store_sync = Instant::now();
                Some(BucketState::new(inner.tokens, inner.last_access))
            } else {
                None
            }
        };

        if let (Some(state), Some(store)) = (persist, &self.store) {
            if let Err(e) = store.set(&self.user_id, state).await {
                warn!(user_id = %self.user_id, error = %e, "Failed to persist bucket state");
            }
        }

        true
    }

    /// Change the refill rate in place
    pub async fn set_rate(&self, rate: u64) {
        let mut inner = self.state.write().await;
        inner.rate = rate.max(1);
    }

    /// Current refill rate in bytes per second
    pub async fn rate(&self) -> u64 {
        self.state.read().await.rate
    }

    /// Token balance as of the last refill
    pub async fn tokens(&self) -> f64 {
        self.state.read().await.tokens
    }

    /// Time of the last refill computation
    pub async fn last_access(&self) -> SystemTime {
        self.state.read().await.last_access
    }

    /// Largest balance the bucket can hold at its current rate
    pub async fn capacity(&self) -> f64 {
        let rate = self.rate().await;
        self.capacity_for(rate)
    }

    /// Point-in-time copy of the persisted fields
    pub async fn snapshot(&self) -> BucketState {
        let inner = self.state.read().await;
        BucketState::new(inner.tokens, inner.last_access)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn burst_multiplier(&self) -> f64 {
        self.burst_multiplier
    }

    // Never below one token so a single byte can always be admitted
    fn capacity_for(&self, rate: u64) -> f64 {
        (rate as f64 * self.burst_multiplier).max(1.0)
    }

    #[cfg(test)]
    pub(crate) async fn force_store_sync_due(&self) {
        let mut inner = self.state.write().await;
        if let Some(past) = Instant::now().checked_sub(STORE_SYNC_INTERVAL * 2) {
            inner.last_store_sync = past;
        }
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("user_id", &self.user_id)
            .field("burst_multiplier", &self.burst_multiplier)
            .field("store", &self.store.as_ref().map(|_| "<StateStore>"))
            .finish()
    }
}
