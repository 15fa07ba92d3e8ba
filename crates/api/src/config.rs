use chrono::FixedOffset;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use domain::models::{PlanLimits, QuotaLimit};
use domain::services::{DispatchSettings, QuotaSettings, SessionSettings};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
    pub jwt: JwtAuthConfig,
    pub sessions: SessionsConfig,
    pub broadcasts: BroadcastsConfig,
    pub quota: QuotaConfig,
    pub provider: ProviderConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl From<&DatabaseConfig> for persistence::db::DatabaseConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            url: config.url.clone(),
            max_connections: config.max_connections,
            min_connections: config.min_connections,
            connect_timeout_secs: config.connect_timeout_secs,
            idle_timeout_secs: config.idle_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Per-user request ceiling; 0 disables the limiter.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtAuthConfig {
    /// RSA public key in PEM format for verifying bearer tokens
    #[serde(default)]
    pub public_key: String,

    /// Leeway in seconds for clock skew tolerance
    #[serde(default = "default_jwt_leeway")]
    pub leeway_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_qr_ttl")]
    pub qr_ttl_secs: u64,

    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout_secs: u64,

    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_qr_retry_after")]
    pub qr_retry_after_secs: u64,

    /// Interval of the overdue-QR sweep job.
    #[serde(default = "default_qr_sweep")]
    pub qr_sweep_secs: u64,
}

impl SessionsConfig {
    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            qr_ttl: Duration::from_secs(self.qr_ttl_secs),
            pairing_timeout: Duration::from_secs(self.pairing_timeout_secs),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            qr_retry_after_secs: self.qr_retry_after_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastsConfig {
    #[serde(default = "default_pacing")]
    pub pacing_ms: u64,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "default_due_poll")]
    pub due_poll_secs: u64,
}

impl BroadcastsConfig {
    pub fn settings(&self) -> DispatchSettings {
        DispatchSettings {
            pacing: Duration::from_millis(self.pacing_ms),
            max_in_flight: self.max_in_flight.max(1),
        }
    }
}

/// Limits applied to users without a plan. Negative means unlimited.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_messages_quota")]
    pub default_messages: i64,

    #[serde(default = "default_devices_quota")]
    pub default_devices: i64,

    #[serde(default = "default_api_requests_quota")]
    pub default_api_requests: i64,

    /// Offset from UTC, in minutes, at which monthly periods roll over.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl QuotaConfig {
    pub fn settings(&self) -> Result<QuotaSettings, ConfigValidationError> {
        let offset = FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            ConfigValidationError::InvalidValue(format!(
                "quota.utc_offset_minutes out of range: {}",
                self.utc_offset_minutes
            ))
        })?;

        Ok(QuotaSettings {
            defaults: PlanLimits {
                messages: QuotaLimit::from_plan_value(Some(self.default_messages)),
                devices: QuotaLimit::from_plan_value(Some(self.default_devices)),
                api_requests: QuotaLimit::from_plan_value(Some(self.default_api_requests)),
            },
            offset,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Http,
    Mock,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,

    /// Base URL of the pairing/transport sidecar (http provider only)
    #[serde(default)]
    pub base_url: String,

    #[serde(default = "default_provider_timeout")]
    pub timeout_ms: u64,

    /// Shared secret for signed provider callbacks
    #[serde(default)]
    pub callback_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_connections() -> u32 {
    20
}
fn default_min_connections() -> u32 {
    5
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    600
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_rate_limit() -> u32 {
    600
}
fn default_jwt_leeway() -> u64 {
    30
}
fn default_qr_ttl() -> u64 {
    60
}
fn default_pairing_timeout() -> u64 {
    30
}
fn default_send_timeout() -> u64 {
    15_000
}
fn default_qr_retry_after() -> u64 {
    2
}
fn default_qr_sweep() -> u64 {
    5
}
fn default_pacing() -> u64 {
    1_000
}
fn default_max_in_flight() -> usize {
    1
}
fn default_due_poll() -> u64 {
    30
}
fn default_messages_quota() -> i64 {
    1_000
}
fn default_devices_quota() -> i64 {
    1
}
fn default_api_requests_quota() -> i64 {
    10_000
}
fn default_provider_kind() -> ProviderKind {
    ProviderKind::Mock
}
fn default_provider_timeout() -> u64 {
    10_000
}
fn default_channel_capacity() -> usize {
    1024
}

/// Configuration validation error
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Loading order (later sources override earlier):
    /// 1. config/default.toml - base configuration with defaults
    /// 2. config/local.toml - local overrides (optional, not in git)
    /// 3. Environment variables with GW__ prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("GW").separator("__"))
            .build()?;

        let cfg: Self = config.try_deserialize()?;
        cfg.validate()
            .map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Ok(cfg)
    }

    /// Builds a config from embedded defaults plus overrides, without
    /// touching the file system.
    pub fn load_for_test(overrides: &[(&str, &str)]) -> Result<Self, config::ConfigError> {
        let defaults = r#"
            [server]
            host = "127.0.0.1"
            port = 8080
            request_timeout_secs = 30

            [database]
            url = ""

            [logging]
            level = "info"
            format = "json"

            [security]
            cors_origins = []
            rate_limit_per_minute = 0

            [jwt]
            public_key = ""
            leeway_secs = 0

            [sessions]
            qr_ttl_secs = 60
            pairing_timeout_secs = 30
            send_timeout_ms = 15000
            qr_retry_after_secs = 2

            [broadcasts]
            pacing_ms = 0
            max_in_flight = 1
            due_poll_secs = 30

            [quota]
            default_messages = 1000
            default_devices = 5
            default_api_requests = 10000
            utc_offset_minutes = 0

            [provider]
            kind = "mock"
            callback_secret = "test-callback-secret"

            [events]
            channel_capacity = 256
        "#;

        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(defaults, config::FileFormat::Toml));

        for (key, value) in overrides {
            builder = builder.set_override(*key, *value)?;
        }

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "GW__DATABASE__URL environment variable must be set".to_string(),
            ));
        }

        if self.server.port == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "Server port cannot be 0".to_string(),
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigValidationError::InvalidValue(
                "min_connections cannot exceed max_connections".to_string(),
            ));
        }

        if self.jwt.public_key.is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "GW__JWT__PUBLIC_KEY must be set".to_string(),
            ));
        }

        if self.provider.kind == ProviderKind::Http {
            if self.provider.base_url.is_empty() {
                return Err(ConfigValidationError::MissingRequired(
                    "provider.base_url is required for the http provider".to_string(),
                ));
            }
            if self.provider.callback_secret.is_empty() {
                return Err(ConfigValidationError::MissingRequired(
                    "provider.callback_secret is required for the http provider".to_string(),
                ));
            }
        }

        if self.quota.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            return Err(ConfigValidationError::InvalidValue(format!(
                "quota.utc_offset_minutes must be within ±{}",
                MAX_UTC_OFFSET_MINUTES
            )));
        }

        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }
}
