//! Connection parameters for a [`StoreClient`](crate::StoreClient).

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{StoreError, StoreResult};

/// Connect timeout applied to the first connection, reconnects and the
/// health check before subscribing.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5000;

/// Matches both keyspace and keyevent expiry channels.
pub const DEFAULT_EXPIRY_PATTERN: &str = "__key*__:expired";

const ENV_HOST: &str = "KV_STORE_HOST";
const ENV_PORT: &str = "KV_STORE_PORT";
const ENV_PASSWORD: &str = "KV_STORE_PASSWORD";
const ENV_DATABASE: &str = "KV_STORE_DATABASE";
const ENV_CONNECT_TIMEOUT_MS: &str = "KV_STORE_CONNECT_TIMEOUT_MS";

/// Client configuration.
///
/// # Example
/// ```ignore
/// let config = StoreConfig::new(2, "10.0.0.5", 6379).with_password("secret");
/// let client = StoreClient::connect(config).await?;
/// ```
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub host: String,

    pub port: u16,

    /// `None` connects without AUTH.
    pub password: Option<String>,

    /// Logical database every operation targets.
    pub database: i64,

    /// Bound on connection establishment and the pre-subscribe health check.
    ///
    /// Default: 5000 ms
    pub connect_timeout_ms: u64,

    /// Interval of the background health check. `0` disables it.
    ///
    /// Default: 5000 ms
    pub heartbeat_interval_ms: u64,

    /// Pattern subscribed to by `enable_key_expiry_subscription`.
    pub expiry_pattern: String,

    /// Issue `CONFIG SET notify-keyspace-events Ex` before subscribing.
    /// Servers ship with notifications disabled; managed servers often
    /// forbid `CONFIG`, so this stays off unless asked for.
    pub configure_keyspace_events: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            database: 0,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            expiry_pattern: DEFAULT_EXPIRY_PATTERN.to_string(),
            configure_keyspace_events: false,
        }
    }
}

// Hand-written so the password never ends up in logs.
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("expiry_pattern", &self.expiry_pattern)
            .field("configure_keyspace_events", &self.configure_keyspace_events)
            .finish()
    }
}

impl StoreConfig {
    pub fn new(database: i64, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            database,
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = millis_ceil(timeout);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = millis_ceil(interval);
        self
    }

    pub fn with_keyspace_events(mut self, enabled: bool) -> Self {
        self.configure_keyspace_events = enabled;
        self
    }

    /// Build a config from the four string-ish parameters a caller usually
    /// has at hand. An empty password means no AUTH.
    pub fn from_parts(database: i64, host: &str, port: &str, password: &str) -> StoreResult<Self> {
        let mut config = Self::new(database, host, parse_port(port)?);
        if !password.is_empty() {
            config.password = Some(password.to_string());
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> StoreResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Create config from environment variables.
    ///
    /// Environment variables:
    /// - `KV_STORE_HOST`: Server host (default: 127.0.0.1)
    /// - `KV_STORE_PORT`: Server port (default: 6379)
    /// - `KV_STORE_PASSWORD`: AUTH password (default: none)
    /// - `KV_STORE_DATABASE`: Database index (default: 0)
    /// - `KV_STORE_CONNECT_TIMEOUT_MS`: Connect timeout (default: 5000)
    pub fn from_env() -> StoreResult<Self> {
        let mut config = Self::default();
        if let Ok(host) = std::env::var(ENV_HOST) {
            config.host = host;
        }
        if let Ok(port) = std::env::var(ENV_PORT) {
            config.port = parse_port(&port)?;
        }
        config.password = std::env::var(ENV_PASSWORD).ok().filter(|p| !p.is_empty());
        if let Ok(database) = std::env::var(ENV_DATABASE) {
            config.database = database.trim().parse().map_err(|_| {
                StoreError::InvalidConfig(format!("{ENV_DATABASE} is not an integer: {database:?}"))
            })?;
        }
        if let Ok(timeout) = std::env::var(ENV_CONNECT_TIMEOUT_MS) {
            config.connect_timeout_ms = timeout.trim().parse().map_err(|_| {
                StoreError::InvalidConfig(format!(
                    "{ENV_CONNECT_TIMEOUT_MS} is not a number: {timeout:?}"
                ))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.host.trim().is_empty() {
            return Err(StoreError::InvalidConfig("host must not be empty".into()));
        }
        if self.database < 0 {
            return Err(StoreError::InvalidConfig(format!(
                "database index must be non-negative, got {}",
                self.database
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(StoreError::InvalidConfig("connect timeout must be positive".into()));
        }
        if self.expiry_pattern.is_empty() {
            return Err(StoreError::InvalidConfig("expiry pattern must not be empty".into()));
        }
        Ok(())
    }

    /// `host:port`, used as the connection label in logs and events.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `None` when the heartbeat is disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }
}

/// Whole milliseconds in `duration`, rounded up so a sub-millisecond value
/// never becomes zero. Saturates at `u64::MAX`.
pub(crate) fn millis_ceil(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

pub fn parse_port(port: &str) -> StoreResult<u16> {
    match port.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(StoreError::InvalidConfig(format!("invalid port: {port:?}"))),
        Ok(port) => Ok(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_connect_policy() {
        let config = StoreConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_secs(5)));
        assert_eq!(config.expiry_pattern, "__key*__:expired");
        assert_eq!(config.endpoint(), "127.0.0.1:6379");
        assert!(!config.configure_keyspace_events);
    }

    #[test]
    fn from_parts_parses_port_and_password() {
        let config = StoreConfig::from_parts(3, "cache.local", "6380", "s3cret").unwrap();
        assert_eq!(config.database, 3);
        assert_eq!(config.port, 6380);
        assert_eq!(config.password.as_deref(), Some("s3cret"));

        let config = StoreConfig::from_parts(0, "cache.local", " 6379 ", "").unwrap();
        assert_eq!(config.port, 6379);
        assert_eq!(config.password, None);
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(matches!(
            StoreConfig::from_parts(0, "h", "redis", ""),
            Err(StoreError::InvalidConfig(_))
        ));
        assert!(StoreConfig::from_parts(0, "h", "0", "").is_err());
        assert!(StoreConfig::from_parts(0, "h", "70000", "").is_err());
        assert!(StoreConfig::from_parts(0, "  ", "6379", "").is_err());
        assert!(StoreConfig::from_parts(-1, "h", "6379", "").is_err());
    }

    #[test]
    fn json_fills_in_defaults() {
        let config = StoreConfig::from_json(r#"{"host": "10.1.2.3", "database": 4}"#).unwrap();
        assert_eq!(config.host, "10.1.2.3");
        assert_eq!(config.database, 4);
        assert_eq!(config.port, 6379);
        assert_eq!(config.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);

        assert!(matches!(
            StoreConfig::from_json(r#"{"port": "six"}"#),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn zero_heartbeat_disables_liveness_check() {
        let config = StoreConfig::default().with_heartbeat_interval(Duration::ZERO);
        assert_eq!(config.heartbeat_interval(), None);
    }

    #[test]
    fn millis_round_up_and_saturate() {
        assert_eq!(millis_ceil(Duration::ZERO), 0);
        assert_eq!(millis_ceil(Duration::from_micros(500)), 1);
        assert_eq!(millis_ceil(Duration::from_millis(1500)), 1500);
        assert_eq!(millis_ceil(Duration::from_micros(1_000_001)), 1001);
        assert_eq!(millis_ceil(Duration::MAX), u64::MAX);
    }

    #[test]
    fn sub_millisecond_durations_are_not_truncated_to_zero() {
        let config = StoreConfig::default()
            .with_connect_timeout(Duration::from_micros(200))
            .with_heartbeat_interval(Duration::from_micros(200));
        assert_eq!(config.connect_timeout_ms, 1);
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_millis(1)));

        let config = StoreConfig::default().with_connect_timeout(Duration::MAX);
        assert_eq!(config.connect_timeout_ms, u64::MAX);
    }

    #[test]
    fn debug_masks_password() {
        let config = StoreConfig::new(0, "h", 1).with_password("hunter2");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }
}
