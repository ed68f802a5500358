//! Configuration management for Gatekeeper.
//!
//! Configuration is read once at startup into an immutable
//! [`GatekeeperConfig`]. Sources, lowest priority first: an optional YAML
//! file, `GATEKEEPER__*` environment variables, then the flat variables of
//! the legacy deployment (`WEB_SERVER_PORT`, `TOKENS_CONFIG_LIMIT`,
//! `IP_CONFIG_LIMIT`, `REDIS_*`).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::LimitOptions;

/// Namespace of token-scoped buckets.
pub const TOKEN_NAMESPACE: &str = "token";
/// Namespace of IP-scoped buckets.
pub const IP_NAMESPACE: &str = "ip";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Event store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Policy applied to callers without a token
    #[serde(default)]
    pub ip_limit: IpLimitConfig,

    /// Per-token policies
    #[serde(default)]
    pub tokens: Vec<TokenLimitConfig>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Upper bound on one admission decision, store round trips included
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_request_timeout_ms() -> u64 {
    1000
}

/// Which event store backs the limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local; limits are not shared between instances.
    Memory,
    /// Shared Redis sorted sets.
    #[default]
    Redis,
}

/// Event store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default)]
    pub redis: RedisConfig,

    /// Expiration refreshed on a bucket each time it records an event
    #[serde(default)]
    pub bucket_ttl_secs: Option<u64>,

    /// How often the memory backend drops expired buckets
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis: RedisConfig::default(),
            bucket_ttl_secs: None,
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl StoreConfig {
    pub fn bucket_ttl(&self) -> Option<Duration> {
        self.bucket_ttl_secs.map(Duration::from_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

fn default_purge_interval_secs() -> u64 {
    30
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
        }
    }
}

impl RedisConfig {
    /// Connection URL in the form `redis://[:password@]host:port/db`.
    pub fn url(&self) -> String {
        match self.password.as_deref() {
            Some(password) if !password.is_empty() => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

/// Policy for callers identified by network origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpLimitConfig {
    /// Requests allowed per window
    pub max_requests: u64,
    /// Window length in seconds
    pub block_time_seconds: u64,
}

impl Default for IpLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            block_time_seconds: 1,
        }
    }
}

impl IpLimitConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.block_time_seconds)
    }
}

/// Policy for one API token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLimitConfig {
    pub token: String,
    pub max_requests: u64,
    pub block_time_seconds: u64,
}

impl TokenLimitConfig {
    /// Limiter options for this token.
    pub fn options(&self) -> LimitOptions {
        LimitOptions::new(TOKEN_NAMESPACE, self.max_requests, self.block_time_seconds)
    }
}

/// Immutable lookup from token to its limiting policy.
#[derive(Debug, Clone, Default)]
pub struct TokenPolicies {
    policies: HashMap<String, LimitOptions>,
}

impl TokenPolicies {
    pub fn new(tokens: &[TokenLimitConfig]) -> Self {
        let policies = tokens
            .iter()
            .map(|t| (t.token.clone(), t.options()))
            .collect();
        Self { policies }
    }

    /// Policy registered for `token`, if any.
    pub fn get(&self, token: &str) -> Option<&LimitOptions> {
        self.policies.get(token)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration file");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from every source and validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GATEKEEPER")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: GatekeeperConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;

        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay the flat variables used by the legacy deployment.
    ///
    /// Unset or empty variables leave the current value untouched.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(port) = var("WEB_SERVER_PORT") {
            self.server.http_addr = parse_listen_addr(&port, self.server.http_addr)?;
        }

        if let Some(json) = var("TOKENS_CONFIG_LIMIT") {
            self.tokens = serde_json::from_str(&json).map_err(|e| {
                GatekeeperError::Config(format!("TOKENS_CONFIG_LIMIT is not valid JSON: {}", e))
            })?;
        }

        if let Some(json) = var("IP_CONFIG_LIMIT") {
            self.ip_limit = serde_json::from_str(&json).map_err(|e| {
                GatekeeperError::Config(format!("IP_CONFIG_LIMIT is not valid JSON: {}", e))
            })?;
        }

        if let Some(host) = var("REDIS_HOST") {
            self.store.redis.host = host;
        }
        if let Some(port) = var("REDIS_PORT") {
            self.store.redis.port = port
                .trim()
                .parse()
                .map_err(|_| GatekeeperError::Config(format!("Invalid REDIS_PORT: {}", port)))?;
        }
        if let Some(password) = var("REDIS_PASSWORD") {
            self.store.redis.password = Some(password);
        }
        if let Some(db) = var("REDIS_DB") {
            self.store.redis.db = db
                .trim()
                .parse()
                .map_err(|_| GatekeeperError::Config(format!("Invalid REDIS_DB: {}", db)))?;
        }

        Ok(())
    }

    /// Reject policies the limiter cannot express.
    ///
    /// A zero max or window would silently fall back to the limiter's own
    /// default, so neither is accepted here.
    pub fn validate(&self) -> Result<()> {
        if self.ip_limit.max_requests == 0 || self.ip_limit.block_time_seconds == 0 {
            return Err(GatekeeperError::Config(
                "ip_limit requires non-zero max_requests and block_time_seconds".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for token in &self.tokens {
            if token.token.is_empty() {
                return Err(GatekeeperError::Config(
                    "token policy with an empty token".to_string(),
                ));
            }
            if token.max_requests == 0 || token.block_time_seconds == 0 {
                return Err(GatekeeperError::Config(format!(
                    "token policy {} requires non-zero max_requests and block_time_seconds",
                    token.token
                )));
            }
            if !seen.insert(token.token.as_str()) {
                return Err(GatekeeperError::Config(format!(
                    "duplicate token policy {}",
                    token.token
                )));
            }
        }

        if self.server.request_timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "server.request_timeout_ms must be non-zero".to_string(),
            ));
        }

        if self.store.purge_interval_secs == 0 {
            return Err(GatekeeperError::Config(
                "store.purge_interval_secs must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the token lookup table handed to the admission gate.
    pub fn token_policies(&self) -> TokenPolicies {
        TokenPolicies::new(&self.tokens)
    }
}

/// Accepts `:8080`, `8080` or a full `host:port`.
fn parse_listen_addr(value: &str, current: SocketAddr) -> Result<SocketAddr> {
    let value = value.trim();
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let port: u16 = value
        .trim_start_matches(':')
        .parse()
        .map_err(|_| GatekeeperError::Config(format!("Invalid WEB_SERVER_PORT: {}", value)))?;
    Ok(SocketAddr::new(current.ip(), port))
}
