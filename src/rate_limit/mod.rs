//! Per-user bandwidth limiting driven by `X-Accel-Redirect` signals
//!
//! A backend answers a request with an empty response carrying
//! `X-Accel-Redirect: <path>` and, optionally, a user id and a rate in bytes per
//! second. [`AccelRedirectLayer`] catches that response, looks up the user's
//! [`TokenBucket`] and sends a rewritten request for `<path>` through the same
//! service stack. [`PaceLayer`], further down the stack, finds the bucket on that
//! second request and releases the response body only as fast as the bucket
//! refills.
//!
//! # Features
//!
//! - One bucket per user, shared by all of that user's concurrent transfers
//! - Reservoir sized by a configurable burst multiplier
//! - In-memory state, or Redis-backed state shared across instances
//! - Fails open: an unreachable Redis never blocks traffic; buckets start full instead
//! - Idle buckets are swept after 30 minutes
//!
//! # Example
//!
//! ```rust,no_run
//! use accel_ratelimit::config::RateLimitSettings;
//! use accel_ratelimit::rate_limit::{AccelRedirectLayer, PaceLayer, RateLimitService};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = Arc::new(
//!         RateLimitService::local_only(&RateLimitSettings::default()).unwrap(),
//!     );
//!
//!     let app: axum::Router = axum::Router::new()
//!         .fallback_service(tower_http::services::ServeDir::new("./public"))
//!         .layer(PaceLayer::new())
//!         .layer(AccelRedirectLayer::new(limiter.clone()));
//!
//!     // ... serve `app`, then on shutdown:
//!     limiter.shutdown().await;
//! }
//! ```

pub mod bucket;
pub mod local;
pub mod lua_scripts;
pub mod middleware;
pub mod pacer;
pub mod redis;
pub mod registry;
pub mod service;
pub mod store;
pub mod task;
pub mod types;

// Re-export commonly used types
pub use bucket::TokenBucket;
pub use local::MemoryStore;
pub use middleware::{
    attached_bucket, AccelRedirectLayer, AccelRedirectService, BucketAttachment, DispatchPass,
    InternalRedirect, PaceLayer, PaceService,
};
pub use pacer::{chunk_size_for_rate, paced_body, PacedWriteError, PacedWriter};
pub use self::redis::{RedisStore, RedisStoreConfig};
pub use registry::BucketRegistry;
pub use service::RateLimitService;
pub use store::StateStore;
pub use types::{BucketState, RateSignal, SignalHeaders, StoreError, StoreResult};
