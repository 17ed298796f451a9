use super::types::{BucketState, StoreResult};
use async_trait::async_trait;

/// Shared state store for per-user bucket state.
///
/// Implementations must be safe to call from many request tasks at once. Every
/// operation is keyed by user id and independent of other users.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the stored state for a user, `Ok(None)` when nothing is stored
    async fn get(&self, user_id: &str) -> StoreResult<Option<BucketState>>;

    /// Store the state for a user
    async fn set(&self, user_id: &str, state: BucketState) -> StoreResult<()>;

    /// Remove the stored state for a user
    async fn delete(&self, user_id: &str) -> StoreResult<()>;

    /// Release resources held by the store
    async fn close(&self) -> StoreResult<()>;

    /// Whether entries expire on their own; otherwise the registry sweep deletes them
    fn has_native_expiry(&self) -> bool;

    /// Whether the store is currently serving requests
    fn is_healthy(&self) -> bool {
        true
    }
}
