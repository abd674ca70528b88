//! Service configuration loaded from YAML with environment overrides.
//!
//! The file path comes from `CAREVAULT_CONFIG` (default
//! `./config/carevault.yaml`). A missing file means all defaults. Invalid
//! values fail startup with a message naming the field.

use std::path::Path;
use std::time::Duration;

use carevault_api_documents::{DocumentsApiConfig, DOCUMENT_STORE_BREAKER, SUBMISSION_SCOPE};
use carevault_resilience::{CircuitBreakerConfig, RateLimitConfig};
use serde::Deserialize;
use thiserror::Error;

/// Default HS256 secret shipped in the sample config; refused in production.
pub const INSECURE_JWT_SECRET: &str = "development-only-jwt-secret-change-me";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Application environment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppEnvironment {
    #[default]
    Development,
    Production,
}

impl AppEnvironment {
    /// Parse an `APP_ENV` value. Unknown values mean development.
    pub fn from_env_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }

    #[must_use]
    pub fn is_production(&self) -> bool {
        *self == Self::Production
    }
}

impl std::fmt::Display for AppEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub app_env: AppEnvironment,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub context: ContextSettings,
    #[serde(default)]
    pub audit: AuditSettings,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_body_size")]
    pub max_body_size_bytes: usize,
    /// Take client IPs from `X-Forwarded-For`; only behind a trusted proxy.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
    /// Include internal error details in responses.
    #[serde(default)]
    pub expose_internal_errors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_size_bytes: default_max_body_size(),
            trust_forwarded_headers: false,
            expose_internal_errors: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024
}

/// Which session pool backs the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    Postgres,
    /// In-process emulation; development only.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: DatabaseBackend,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connections reserved for audit writes, separate from the pool the
    /// broker checks sessions out of.
    #[serde(default = "default_audit_max_connections")]
    pub audit_max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::default(),
            url: None,
            max_connections: default_max_connections(),
            audit_max_connections: default_audit_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
            run_migrations: true,
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_audit_max_connections() -> u32 {
    2
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

/// Counter store. Without a URL an in-process store is used, which is only
/// correct for a single instance.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

fn default_operation_timeout_ms() -> u64 {
    carevault_store::DEFAULT_OPERATION_TIMEOUT_MS
}

/// Public submission rate limit.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            lockout_secs: default_lockout_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_max_requests() -> u64 {
    carevault_resilience::rate_limit::DEFAULT_MAX_REQUESTS
}

fn default_window_secs() -> u64 {
    carevault_resilience::rate_limit::DEFAULT_WINDOW_SECS
}

fn default_lockout_secs() -> u64 {
    carevault_resilience::rate_limit::DEFAULT_LOCKOUT_SECS
}

fn default_key_prefix() -> String {
    carevault_resilience::DEFAULT_KEY_PREFIX.to_string()
}

/// Document store circuit breaker.
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_half_open_max_trials")]
    pub half_open_max_trials: u32,
    #[serde(default = "default_trial_timeout_secs")]
    pub trial_timeout_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            half_open_max_trials: default_half_open_max_trials(),
            trial_timeout_secs: default_trial_timeout_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    900
}

fn default_half_open_max_trials() -> u32 {
    1
}

fn default_trial_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextSettings {
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            handler_timeout_secs: default_handler_timeout(),
        }
    }
}

fn default_handler_timeout() -> u64 {
    carevault_db::context::DEFAULT_HANDLER_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditSettings {
    #[serde(default = "default_min_retention_days")]
    pub min_retention_days: i64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            min_retention_days: default_min_retention_days(),
        }
    }
}

fn default_min_retention_days() -> i64 {
    carevault_db::audit::DEFAULT_MIN_RETENTION_DAYS
}

/// Bearer token validation. Exactly one of `jwt_secret` (HS256) and
/// `public_key_path` (RS256) must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default)]
    pub public_key_path: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            public_key_path: None,
            issuer: None,
            audience: None,
            leeway_secs: default_leeway(),
        }
    }
}

fn default_leeway() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info,carevault=debug".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: String,
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            max_document_bytes: default_max_document_bytes(),
        }
    }
}

fn default_storage_root() -> String {
    "./data/documents".to_string()
}

fn default_max_document_bytes() -> usize {
    carevault_api_documents::handlers::DEFAULT_MAX_DOCUMENT_BYTES
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
                path: path.as_ref().display().to_string(),
                source,
            })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Get the configuration file path from environment or default.
    pub fn config_path() -> String {
        std::env::var("CAREVAULT_CONFIG")
            .unwrap_or_else(|_| "./config/carevault.yaml".to_string())
    }

    /// Load from [`Self::config_path`], apply environment overrides and
    /// validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();
        let mut config = if Path::new(&path).exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides, read through `lookup`.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(env) = lookup("APP_ENV") {
            self.app_env = AppEnvironment::from_env_str(&env);
        }
        if let Some(host) = lookup("CAREVAULT_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("CAREVAULT_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| invalid("CAREVAULT_PORT", format!("{e}")))?;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.redis.url = Some(url);
        }
        if let Some(secret) = lookup("JWT_SECRET") {
            self.auth.jwt_secret = Some(secret);
        }
        if let Some(filter) = lookup("RUST_LOG") {
            self.logging.level = filter;
        }
        Ok(())
    }

    /// Check value ranges and production constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.max_requests == 0 {
            return Err(invalid("rate_limit.max_requests", "must be positive"));
        }
        if self.rate_limit.window_secs == 0 || self.rate_limit.lockout_secs == 0 {
            return Err(invalid(
                "rate_limit.window_secs",
                "window and lockout must be positive",
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be positive"));
        }
        if self.circuit_breaker.half_open_max_trials == 0 {
            return Err(invalid("circuit_breaker.half_open_max_trials", "must be positive"));
        }
        if self.context.handler_timeout_secs == 0 {
            return Err(invalid("context.handler_timeout_secs", "must be positive"));
        }
        if self.database.max_connections == 0 || self.database.audit_max_connections == 0 {
            return Err(invalid(
                "database.max_connections",
                "session and audit pools need at least one connection each",
            ));
        }
        if self.audit.min_retention_days < 1 {
            return Err(invalid("audit.min_retention_days", "must be positive"));
        }

        match (&self.auth.jwt_secret, &self.auth.public_key_path) {
            (None, None) => {
                return Err(invalid(
                    "auth",
                    "set auth.jwt_secret (or JWT_SECRET) or auth.public_key_path",
                ))
            }
            (Some(_), Some(_)) => {
                return Err(invalid(
                    "auth",
                    "jwt_secret and public_key_path are mutually exclusive",
                ))
            }
            _ => {}
        }

        if self.database.backend == DatabaseBackend::Postgres && self.database.url.is_none() {
            return Err(invalid(
                "database.url",
                "required for the postgres backend (or set DATABASE_URL)",
            ));
        }

        if self.app_env.is_production() {
            if self.database.backend == DatabaseBackend::Memory {
                return Err(invalid("database.backend", "memory backend is development only"));
            }
            if self.auth.jwt_secret.as_deref() == Some(INSECURE_JWT_SECRET) {
                return Err(invalid("auth.jwt_secret", "insecure default secret in production"));
            }
            if self.server.expose_internal_errors {
                return Err(invalid(
                    "server.expose_internal_errors",
                    "must be off in production",
                ));
            }
            if self.redis.url.is_none() {
                return Err(invalid(
                    "redis.url",
                    "a shared counter store is required in production",
                ));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.context.handler_timeout_secs)
    }

    /// Documents API tunables derived from this configuration.
    pub fn documents_api(&self) -> DocumentsApiConfig {
        let rate_limit = RateLimitConfig::for_scope(SUBMISSION_SCOPE)
            .with_max_requests(self.rate_limit.max_requests)
            .with_window(Duration::from_secs(self.rate_limit.window_secs))
            .with_lockout(Duration::from_secs(self.rate_limit.lockout_secs))
            .with_key_prefix(self.rate_limit.key_prefix.clone());
        let breaker = CircuitBreakerConfig::named(DOCUMENT_STORE_BREAKER)
            .with_failure_threshold(self.circuit_breaker.failure_threshold)
            .with_cooldown(Duration::from_secs(self.circuit_breaker.cooldown_secs))
            .with_half_open_max_trials(self.circuit_breaker.half_open_max_trials)
            .with_trial_timeout(Duration::from_secs(self.circuit_breaker.trial_timeout_secs))
            .with_key_prefix(self.rate_limit.key_prefix.clone());

        DocumentsApiConfig {
            submission_rate_limit: rate_limit,
            document_store_breaker: breaker,
            max_document_bytes: self.storage.max_document_bytes,
            max_body_bytes: self.server.max_body_size_bytes,
            expose_internal_errors: self.server.expose_internal_errors,
            trust_forwarded_headers: self.server.trust_forwarded_headers,
        }
    }
}
