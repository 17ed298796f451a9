use super::store::StateStore;
use super::types::{BucketState, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

/// In-process state store.
///
/// Entries never expire on their own; the registry sweep deletes them together
/// with the bucket.
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: DashMap<String, BucketState>,
}

impl MemoryStore {
    /// Create an empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries (for testing/monitoring)
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, user_id: &str) -> StoreResult<Option<BucketState>> {
        Ok(self.states.get(user_id).map(|entry| *entry.value()))
    }

    async fn set(&self, user_id: &str, state: BucketState) -> StoreResult<()> {
        self.states.insert(user_id.to_string(), state);
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> StoreResult<()> {
        self.states.remove(user_id);
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        debug!(entries = self.states.len(), "Clearing memory store");
        self.states.clear();
        Ok(())
    }

    fn has_native_expiry(&self) -> bool {
        false
    }
}
