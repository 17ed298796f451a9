use crate::error::{AppError, Result};
use crate::rate_limit::types::{
    SignalHeaders, DEFAULT_BURST_MULTIPLIER, DEFAULT_HEADER_RATE_LIMIT, DEFAULT_HEADER_USER_ID,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Backend routes that are reverse-proxied
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Local content served when no route matches
    #[serde(default)]
    pub static_files: StaticFilesConfig,
    /// Bandwidth limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Prometheus endpoint
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Backend request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Route path pattern (e.g., "/api/users/:id" or "/app/*rest")
    pub path: String,
    /// Backend service URL
    pub backend: String,
    /// Allowed HTTP methods (if empty, all methods allowed)
    #[serde(default)]
    pub methods: Vec<String>,
    /// Whether to strip the static part of the pattern when forwarding
    #[serde(default)]
    pub strip_prefix: bool,
    /// Route description
    #[serde(default)]
    pub description: String,
}

/// Static file stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticFilesConfig {
    /// Directory redirect targets are resolved against
    #[serde(default = "default_static_root")]
    pub root: PathBuf,
}

/// Signal header names, reservoir sizing and the shared state backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Header naming the user a redirect is limited for
    #[serde(default = "default_header_user_id")]
    pub header_user_id: String,
    /// Header carrying the limit in bytes per second
    #[serde(default = "default_header_rate_limit")]
    pub header_rate_limit: String,
    /// Reservoir size as a multiple of the rate
    #[serde(default = "default_burst_multiplier")]
    pub burst_multiplier: f64,
    /// Largest request body held for replay on the redirect pass
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
    /// Redis backend; the in-memory store is used when absent
    #[serde(default)]
    pub redis: Option<RedisSettings>,
}

/// Redis backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    /// `redis://` URL or bare `host:port`
    pub address: String,
    /// Startup connection check timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Key namespace
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// Prometheus endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_max_request_body_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    30
}

fn default_static_root() -> PathBuf {
    PathBuf::from("./public")
}

fn default_header_user_id() -> String {
    DEFAULT_HEADER_USER_ID.to_string()
}

fn default_header_rate_limit() -> String {
    DEFAULT_HEADER_RATE_LIMIT.to_string()
}

fn default_burst_multiplier() -> f64 {
    DEFAULT_BURST_MULTIPLIER
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for StaticFilesConfig {
    fn default() -> Self {
        Self {
            root: default_static_root(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            header_user_id: default_header_user_id(),
            header_rate_limit: default_header_rate_limit(),
            burst_multiplier: default_burst_multiplier(),
            max_request_body_bytes: default_max_request_body_bytes(),
            redis: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

impl RedisSettings {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout_secs: default_connect_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RateLimitSettings {
    /// Parsed signal header names
    pub fn signal_headers(&self) -> Result<SignalHeaders> {
        SignalHeaders::new(&self.header_user_id, &self.header_rate_limit)
            .map_err(|e| AppError::Config(format!("Invalid signal header name: {}", e)))
    }

    fn validate(&self) -> Result<()> {
        if self.header_user_id.trim().is_empty() || self.header_rate_limit.trim().is_empty() {
            return Err(AppError::Config(
                "Signal header names cannot be empty".to_string(),
            ));
        }

        self.signal_headers()?;

        if !self.burst_multiplier.is_finite() || self.burst_multiplier <= 0.0 {
            return Err(AppError::Config(format!(
                "Burst multiplier must be a positive number, got {}",
                self.burst_multiplier
            )));
        }

        if self.max_request_body_bytes == 0 {
            return Err(AppError::Config(
                "max_request_body_bytes must be > 0".to_string(),
            ));
        }

        if let Some(redis) = &self.redis {
            if redis.address.trim().is_empty() {
                return Err(AppError::Config(
                    "Redis address cannot be empty".to_string(),
                ));
            }
            if redis.connect_timeout_secs == 0 {
                return Err(AppError::Config(
                    "Redis connect timeout must be > 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for route in &self.routes {
            if route.path.is_empty() {
                return Err(AppError::InvalidRoute(
                    "Route path cannot be empty".to_string(),
                ));
            }

            if route.backend.is_empty() {
                return Err(AppError::InvalidRoute(format!(
                    "Backend URL cannot be empty for route: {}",
                    route.path
                )));
            }

            if !route.backend.starts_with("http://") && !route.backend.starts_with("https://") {
                return Err(AppError::InvalidRoute(format!(
                    "Backend URL must start with http:// or https:// for route: {}",
                    route.path
                )));
            }

            for method in &route.methods {
                let method_upper = method.to_uppercase();
                if !["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"]
                    .contains(&method_upper.as_str())
                {
                    return Err(AppError::InvalidRoute(format!(
                        "Invalid HTTP method '{}' for route: {}",
                        method, route.path
                    )));
                }
            }
        }

        if self.static_files.root.as_os_str().is_empty() {
            return Err(AppError::Config(
                "Static file root cannot be empty".to_string(),
            ));
        }

        self.rate_limit.validate()?;

        if self.metrics.enabled && !self.metrics.path.starts_with('/') {
            return Err(AppError::Config(format!(
                "Metrics path must start with '/', got '{}'",
                self.metrics.path
            )));
        }

        Ok(())
    }

    /// Create a default configuration for testing
    pub fn default_config() -> Self {
        Self {
            server: ServerConfig::default(),
            routes: vec![],
            static_files: StaticFilesConfig::default(),
            rate_limit: RateLimitSettings::default(),
            metrics: MetricsConfig {
                enabled: false,
                path: default_metrics_path(),
            },
        }
    }
}
