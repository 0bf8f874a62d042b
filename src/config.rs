//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `LLM_TUNNEL_API_KEY`, `LLM_TUNNEL_LISTEN`,
//!    `LLM_TUNNEL_AUTH_TOKEN`, `LLM_TUNNEL_JWT_SECRET`, `LLM_TUNNEL_TENANT_ID`
//! 2. **Config file**: path via `--config <path>`, or `llm-tunnel.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [broker]
//! listen = "0.0.0.0:8443"
//! api_key = "facade-secret"
//! admin_key = "admin-secret"
//! registration_timeout_secs = 10
//! request_timeout_secs = 60
//! max_body_bytes = 16777216
//! sweep_interval_ms = 1000
//!
//! [auth]
//! jwt_secret = "shared-hs256-secret"
//! issuer = "llm-tunnel"
//! audience = "tunnel-broker"
//! leeway_secs = 30
//!
//! [agent]
//! broker_url = "wss://broker.example.com/api/tunnel/register"
//! tenant_id = "acme"
//! auth_token = "<jwt>"
//! local_url = "http://127.0.0.1:11434"
//! forward_timeout_secs = 30
//! queue_capacity = 256
//! max_concurrent_forwards = 16
//! reconnect_initial_ms = 1000
//! reconnect_max_secs = 60
//! reconnect_max_attempts = 10       # at least 1
//! status_listen = "127.0.0.1:7070"  # optional local status server
//!
//! [heartbeat]
//! interval_secs = 30
//! pong_timeout_secs = 5
//! # stale_threshold_secs defaults to 1.5 x interval
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! cooldown_secs = 60
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::auth::TokenValidator;
use crate::tunnel::circuit::CircuitSettings;
use crate::tunnel::client::ClientSettings;
use crate::tunnel::health::HeartbeatSettings;
use crate::tunnel::reconnect::BackoffSettings;
use crate::tunnel::relay::BrokerSettings;
use crate::tunnel::router::RouterSettings;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "llm-tunnel.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker listener and routing limits.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Socket address to bind (default `0.0.0.0:8443`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Bearer key for `/t/{tenant}/*`. Override with `LLM_TUNNEL_API_KEY`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_secret")]
    pub api_key: String,
    /// `?token=` for `/api/tunnel/sessions` (default `"change-me"`).
    #[serde(default = "default_secret")]
    pub admin_key: String,
    /// Seconds an agent has to send `register` after connecting (default 10).
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_secs: u64,
    /// Per-request timeout in seconds (default 60).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Largest accepted facade request body (default 16 MiB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Health sweep period in milliseconds (default 1000).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

/// Registration token validation.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret. Override with `LLM_TUNNEL_JWT_SECRET`.
    #[serde(default = "default_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    /// Clock skew tolerated on `exp`, in seconds (default 30).
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

/// Agent (tunnel client) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Broker registration endpoint.
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Override with `LLM_TUNNEL_TENANT_ID`.
    #[serde(default)]
    pub tenant_id: String,
    /// Registration JWT. Override with `LLM_TUNNEL_AUTH_TOKEN`.
    #[serde(default)]
    pub auth_token: String,
    /// Loopback LLM runtime origin (default `http://127.0.0.1:11434`).
    #[serde(default = "default_local_url")]
    pub local_url: String,
    /// Bound on each local call and on gaps between streamed chunks (default 30).
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_concurrent_forwards")]
    pub max_concurrent_forwards: usize,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    /// Consecutive failed reconnects before giving up (at least 1).
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    /// Optional local status server address.
    pub status_listen: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
    /// Silence after which the broker evicts a session. Defaults to 1.5 x interval.
    pub stale_threshold_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8443".to_string()
}
fn default_secret() -> String {
    "change-me".to_string()
}
fn default_registration_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    60
}
fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_sweep_interval_ms() -> u64 {
    1000
}
fn default_issuer() -> String {
    "llm-tunnel".to_string()
}
fn default_audience() -> String {
    "tunnel-broker".to_string()
}
fn default_leeway() -> u64 {
    30
}
fn default_broker_url() -> String {
    "ws://127.0.0.1:8443/api/tunnel/register".to_string()
}
fn default_local_url() -> String {
    crate::tunnel::forwarder::DEFAULT_LOCAL_URL.to_string()
}
fn default_forward_timeout() -> u64 {
    30
}
fn default_queue_capacity() -> usize {
    crate::tunnel::queue::DEFAULT_QUEUE_CAPACITY
}
fn default_max_concurrent_forwards() -> usize {
    16
}
fn default_reconnect_initial_ms() -> u64 {
    1000
}
fn default_reconnect_max_secs() -> u64 {
    60
}
fn default_reconnect_max_attempts() -> u32 {
    10
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_pong_timeout() -> u64 {
    5
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            api_key: default_secret(),
            admin_key: default_secret(),
            registration_timeout_secs: default_registration_timeout(),
            request_timeout_secs: default_request_timeout(),
            max_body_bytes: default_max_body_bytes(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_secret(),
            issuer: default_issuer(),
            audience: default_audience(),
            leeway_secs: default_leeway(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            tenant_id: String::new(),
            auth_token: String::new(),
            local_url: default_local_url(),
            forward_timeout_secs: default_forward_timeout(),
            queue_capacity: default_queue_capacity(),
            max_concurrent_forwards: default_max_concurrent_forwards(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_secs: default_reconnect_max_secs(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            status_listen: None,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            pong_timeout_secs: default_pong_timeout(),
            stale_threshold_secs: None,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `llm-tunnel.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("heartbeat.interval_secs", self.heartbeat.interval_secs),
            ("heartbeat.pong_timeout_secs", self.heartbeat.pong_timeout_secs),
            ("heartbeat.stale_threshold_secs", self.heartbeat.stale_threshold_secs.unwrap_or(1)),
            ("broker.request_timeout_secs", self.broker.request_timeout_secs),
            ("agent.forward_timeout_secs", self.agent.forward_timeout_secs),
            ("agent.reconnect_max_attempts", u64::from(self.agent.reconnect_max_attempts)),
            ("agent.queue_capacity", self.agent.queue_capacity as u64),
            ("agent.max_concurrent_forwards", self.agent.max_concurrent_forwards as u64),
            ("circuit_breaker.failure_threshold", u64::from(self.circuit_breaker.failure_threshold)),
        ];
        match nonzero.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::Invalid(format!("{name} must be greater than zero"))),
            None => Ok(()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `LLM_TUNNEL_*` overrides looked up through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("LLM_TUNNEL_API_KEY") {
            self.broker.api_key = key;
        }
        if let Some(listen) = var("LLM_TUNNEL_LISTEN") {
            self.broker.listen = listen;
        }
        if let Some(secret) = var("LLM_TUNNEL_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(token) = var("LLM_TUNNEL_AUTH_TOKEN") {
            self.agent.auth_token = token;
        }
        if let Some(tenant) = var("LLM_TUNNEL_TENANT_ID") {
            self.agent.tenant_id = tenant;
        }
    }

    pub fn heartbeat_settings(&self) -> HeartbeatSettings {
        let mut settings = HeartbeatSettings::new(
            Duration::from_secs(self.heartbeat.interval_secs),
            Duration::from_secs(self.heartbeat.pong_timeout_secs),
        );
        if let Some(stale) = self.heartbeat.stale_threshold_secs {
            settings.stale_threshold = Duration::from_secs(stale);
        }
        settings
    }

    pub fn backoff_settings(&self) -> BackoffSettings {
        BackoffSettings {
            initial: Duration::from_millis(self.agent.reconnect_initial_ms),
            max: Duration::from_secs(self.agent.reconnect_max_secs),
            max_attempts: self.agent.reconnect_max_attempts,
        }
    }

    pub fn circuit_settings(&self) -> CircuitSettings {
        CircuitSettings {
            failure_threshold: self.circuit_breaker.failure_threshold,
            cooldown: Duration::from_secs(self.circuit_breaker.cooldown_secs),
        }
    }

    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            request_timeout: Duration::from_secs(self.broker.request_timeout_secs),
            circuit: self.circuit_settings(),
        }
    }

    pub fn broker_settings(&self) -> Result<BrokerSettings, ConfigError> {
        self.validate()?;
        Ok(BrokerSettings {
            listen: self.broker.listen.clone(),
            api_key: self.broker.api_key.clone(),
            admin_key: self.broker.admin_key.clone(),
            registration_timeout: Duration::from_secs(self.broker.registration_timeout_secs),
            max_body_bytes: self.broker.max_body_bytes,
            sweep_interval: Duration::from_millis(self.broker.sweep_interval_ms.max(1)),
            heartbeat: self.heartbeat_settings(),
            router: self.router_settings(),
        })
    }

    pub fn token_validator(&self) -> TokenValidator {
        TokenValidator::new(
            self.auth.jwt_secret.as_bytes(),
            &self.auth.issuer,
            &self.auth.audience,
            Duration::from_secs(self.auth.leeway_secs),
        )
    }

    /// Client settings for the agent. Requires a tenant and a token.
    pub fn client_settings(&self) -> Result<ClientSettings, ConfigError> {
        if self.agent.tenant_id.is_empty() {
            return Err(ConfigError::Invalid("agent.tenant_id is required".into()));
        }
        if self.agent.auth_token.is_empty() {
            return Err(ConfigError::Invalid("agent.auth_token is required".into()));
        }
        self.validate()?;
        let mut settings = ClientSettings::new(&self.agent.broker_url, &self.agent.tenant_id, &self.agent.auth_token);
        settings.heartbeat = self.heartbeat_settings();
        settings.backoff = self.backoff_settings();
        settings.queue_capacity = self.agent.queue_capacity;
        settings.registration_timeout = Duration::from_secs(self.broker.registration_timeout_secs);
        settings.max_concurrent_forwards = self.agent.max_concurrent_forwards;
        Ok(settings)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.forward_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.broker.listen, "0.0.0.0:8443");
        let hb = c.heartbeat_settings();
        assert_eq!(hb.interval, Duration::from_secs(30));
        assert_eq!(hb.pong_timeout, Duration::from_secs(5));
        assert_eq!(hb.stale_threshold, Duration::from_secs(45));
        let circuit = c.circuit_settings();
        assert_eq!(circuit.failure_threshold, 5);
        assert_eq!(circuit.cooldown, Duration::from_secs(60));
        assert_eq!(c.router_settings().request_timeout, Duration::from_secs(60));
        assert_eq!(c.agent.queue_capacity, 256);
        assert_eq!(c.forward_timeout(), Duration::from_secs(30));
        assert!(c.forward_timeout() < c.router_settings().request_timeout);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let c: Config = toml::from_str(
            r#"
            [agent]
            tenant_id = "acme"
            auth_token = "jwt"
            reconnect_max_attempts = 3

            [heartbeat]
            interval_secs = 10
            stale_threshold_secs = 12
            "#,
        )
        .unwrap();
        let settings = c.client_settings().unwrap();
        assert_eq!(settings.tenant_id, "acme");
        assert_eq!(settings.backoff.max_attempts, 3);
        assert_eq!(settings.heartbeat.interval, Duration::from_secs(10));
        assert_eq!(settings.heartbeat.stale_threshold, Duration::from_secs(12));
        assert_eq!(c.broker.api_key, "change-me");
    }

    #[test]
    fn env_overrides_win() {
        let mut c = Config::default();
        c.apply_overrides(|name| match name {
            "LLM_TUNNEL_API_KEY" => Some("k".into()),
            "LLM_TUNNEL_TENANT_ID" => Some("globex".into()),
            _ => None,
        });
        assert_eq!(c.broker.api_key, "k");
        assert_eq!(c.agent.tenant_id, "globex");
        assert_eq!(c.auth.jwt_secret, "change-me");
    }

    #[test]
    fn agent_requires_identity() {
        let c = Config::default();
        assert!(matches!(c.client_settings(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load(Some(Path::new("/nonexistent/llm-tunnel.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn zero_intervals_and_thresholds_are_rejected() {
        for section in [
            "[heartbeat]\ninterval_secs = 0",
            "[heartbeat]\npong_timeout_secs = 0",
            "[circuit_breaker]\nfailure_threshold = 0",
            "[agent]\nreconnect_max_attempts = 0",
            "[agent]\nmax_concurrent_forwards = 0",
        ] {
            let mut c: Config = toml::from_str(section).unwrap();
            c.agent.tenant_id = "acme".into();
            c.agent.auth_token = "jwt".into();
            assert!(
                matches!(c.client_settings(), Err(ConfigError::Invalid(_))),
                "accepted {section}"
            );
            assert!(matches!(c.broker_settings(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn invalid_file_fails_to_load() {
        let path = std::env::temp_dir().join(format!("llm-tunnel-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[heartbeat]\ninterval_secs = 0\n").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        std::fs::remove_file(&path).ok();
        let ConfigError::Invalid(message) = err else {
            panic!("expected invalid config, got {err}");
        };
        assert!(message.contains("heartbeat.interval_secs"));
    }
}
