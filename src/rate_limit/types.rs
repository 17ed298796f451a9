use http::{HeaderMap, HeaderName};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

/// Header whose presence on a response triggers the internal redirect
pub const HEADER_REDIRECT: &str = "X-Accel-Redirect";
/// Default header naming the user a redirect is limited for
pub const DEFAULT_HEADER_USER_ID: &str = "X-Accel-User-ID";
/// Default header carrying the limit in bytes per second
pub const DEFAULT_HEADER_RATE_LIMIT: &str = "X-Accel-RateLimit";
/// Default burst multiplier applied to the rate to size the reservoir
pub const DEFAULT_BURST_MULTIPLIER: f64 = 1.0;

/// Minimum time between two writes of a bucket's state to the store
pub const STORE_SYNC_INTERVAL: Duration = Duration::from_secs(5);
/// Buckets idle for longer than this are evicted, and stored state expires after it
pub const IDLE_EXPIRY: Duration = Duration::from_secs(30 * 60);
/// Interval of the registry sweep
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Result type for shared state store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by a shared state store backend
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store operation '{0}' timed out")]
    Timeout(&'static str),

    #[error("Store is not connected")]
    NotConnected,

    #[error("Malformed stored value: {0}")]
    Malformed(String),
}

/// Persisted form of a token bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Token balance at `last_access`
    pub tokens: f64,
    /// Wall-clock time of the last refill computation
    pub last_access: SystemTime,
}

impl BucketState {
    pub fn new(tokens: f64, last_access: SystemTime) -> Self {
        Self {
            tokens,
            last_access,
        }
    }

    /// State handed out by an unavailable store: large enough that any admission succeeds
    pub fn unlimited() -> Self {
        Self::new(f64::MAX, SystemTime::now())
    }

    /// `last_access` as nanoseconds since the Unix epoch (0 for pre-epoch times)
    pub fn last_access_nanos(&self) -> i64 {
        self.last_access
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
            .unwrap_or(0)
    }

    /// Build a state from a token count and a Unix nanosecond timestamp
    pub fn from_nanos(tokens: f64, nanos: i64) -> Self {
        let last_access = UNIX_EPOCH + Duration::from_nanos(nanos.max(0) as u64);
        Self::new(tokens, last_access)
    }
}

/// Configured names of the optional signal headers
#[derive(Debug, Clone)]
pub struct SignalHeaders {
    pub user_id: HeaderName,
    pub rate_limit: HeaderName,
}

impl SignalHeaders {
    /// Build from configured header names (case-insensitive)
    pub fn new(user_id: &str, rate_limit: &str) -> Result<Self, http::header::InvalidHeaderName> {
        Ok(Self {
            user_id: HeaderName::from_bytes(user_id.trim().as_bytes())?,
            rate_limit: HeaderName::from_bytes(rate_limit.trim().as_bytes())?,
        })
    }
}

impl Default for SignalHeaders {
    fn default() -> Self {
        Self {
            user_id: HeaderName::from_static("x-accel-user-id"),
            rate_limit: HeaderName::from_static("x-accel-ratelimit"),
        }
    }
}

/// Redirect signal read from a downstream response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateSignal {
    /// Internal path the request is re-dispatched to
    pub redirect_path: String,
    /// User the limit applies to
    pub user_id: Option<String>,
    /// Limit in bytes per second, present only when it parsed as a positive integer
    pub rate_bytes_per_sec: Option<u64>,
}

impl RateSignal {
    /// Read a signal from response headers.
    ///
    /// Returns `None` when the redirect header is absent or empty, which means the
    /// response is a normal terminal response. A missing user or an unparseable rate
    /// still yields a signal, just one without a limit.
    pub fn from_headers(headers: &HeaderMap, names: &SignalHeaders) -> Option<Self> {
        let redirect_path = redirect_target(headers.get(HEADER_REDIRECT)?.as_bytes())?;

        let user_id = headers
            .get(&names.user_id)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).trim().to_string())
            .filter(|v| !v.is_empty());

        let rate_bytes_per_sec = match header_str(headers, &names.rate_limit) {
            None => None,
            Some(raw) => match raw.parse::<u64>() {
                Ok(rate) if rate > 0 => Some(rate),
                Ok(_) => {
                    warn!(value = raw, "Rate limit must be positive, redirecting without limit");
                    crate::metrics::record_signal_parse_error("rate");
                    None
                }
                Err(e) => {
                    warn!(value = raw, error = %e, "Failed to parse rate limit, redirecting without limit");
                    crate::metrics::record_signal_parse_error("rate");
                    None
                }
            },
        };

        if user_id.is_none() || rate_bytes_per_sec.is_none() {
            debug!(
                redirect = %redirect_path,
                missing_user_id = user_id.is_none(),
                missing_rate_limit = rate_bytes_per_sec.is_none(),
                "Signal carries no usable limit, redirect only"
            );
        }

        Some(Self {
            redirect_path,
            user_id,
            rate_bytes_per_sec,
        })
    }

    /// User and rate, when both are usable
    pub fn limit(&self) -> Option<(&str, u64)> {
        match (&self.user_id, self.rate_bytes_per_sec) {
            (Some(user_id), Some(rate)) => Some((user_id.as_str(), rate)),
            _ => None,
        }
    }
}

/// Redirect target from the raw header bytes.
///
/// Header values may carry obs-text (bytes above 0x7f, e.g. a UTF-8 file name);
/// those are percent-encoded so the target is still a valid request path.
fn redirect_target(raw: &[u8]) -> Option<String> {
    let trimmed = raw.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.is_ascii() {
        return Some(String::from_utf8_lossy(trimmed).into_owned());
    }

    debug!(
        raw = %String::from_utf8_lossy(trimmed),
        "Percent-encoding non-ASCII bytes in redirect target"
    );
    let mut encoded = String::with_capacity(trimmed.len() * 3);
    for &byte in trimmed {
        if byte.is_ascii() {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    Some(encoded)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
