//! Realtime layer configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use helpdesk_shared::SettingsStore;

use crate::backoff::ReconnectPolicy;
use crate::telemetry::LogFormat;

/// Settings key holding the auto-close grace period in hours
pub const AUTO_CLOSE_HOURS_KEY: &str = "auto_close_hours";

/// Longest accepted auto-close grace period (one year)
pub const MAX_AUTO_CLOSE_HOURS: u32 = 8760;

/// Configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // File storage
    pub storage_url: String,
    pub storage_service_key: String,
    pub storage_bucket: String,

    // Connection manager
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: u32,
    pub heartbeat_timeout_ms: u64,

    // Typing presence
    pub typing_ttl_secs: u64,
    pub typing_sweep_secs: u64,
    pub typing_throttle_ms: u64,

    // Activity timeline
    pub dedup_window_ms: u64,

    // Lifecycle
    pub auto_close_default_hours: u32,
    pub auto_close_refresh_secs: u64,

    // Logging
    pub log_format: LogFormat,
}

impl Config {
    /// Load `.env` if present, then read the environment
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            // Database
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 3),

            // File storage
            storage_url: env::var("STORAGE_URL").unwrap_or_default(),
            storage_service_key: env::var("STORAGE_SERVICE_KEY").unwrap_or_default(),
            storage_bucket: env::var("STORAGE_BUCKET").unwrap_or_else(|_| "chat-media".to_string()),

            // Connection manager
            reconnect_initial_ms: parse_or("REALTIME_RECONNECT_INITIAL_MS", 1_000),
            reconnect_max_ms: parse_or("REALTIME_RECONNECT_MAX_MS", 16_000),
            reconnect_max_attempts: parse_or("REALTIME_RECONNECT_MAX_ATTEMPTS", 5),
            heartbeat_timeout_ms: parse_or("REALTIME_HEARTBEAT_TIMEOUT_MS", 60_000),

            // Typing presence
            typing_ttl_secs: parse_or("TYPING_TTL_SECS", 30),
            typing_sweep_secs: parse_or("TYPING_SWEEP_SECS", 5),
            typing_throttle_ms: parse_or("TYPING_THROTTLE_MS", 2_000),

            // Activity timeline
            dedup_window_ms: parse_or("ACTIVITY_DEDUP_WINDOW_MS", 5_000),

            // Lifecycle
            auto_close_default_hours: parse_or("AUTO_CLOSE_DEFAULT_HOURS", 24),
            auto_close_refresh_secs: parse_or("AUTO_CLOSE_REFRESH_SECS", 60),

            // Logging
            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reconnect_initial_ms == 0 {
            return Err(ConfigError::Invalid(
                "REALTIME_RECONNECT_INITIAL_MS",
                "must be greater than zero".to_string(),
            ));
        }
        if self.reconnect_max_ms < self.reconnect_initial_ms {
            return Err(ConfigError::Invalid(
                "REALTIME_RECONNECT_MAX_MS",
                format!("must be at least {}", self.reconnect_initial_ms),
            ));
        }
        if self.reconnect_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "REALTIME_RECONNECT_MAX_ATTEMPTS",
                "must be greater than zero".to_string(),
            ));
        }
        if self.typing_sweep_secs == 0 || self.typing_sweep_secs > self.typing_ttl_secs {
            return Err(ConfigError::Invalid(
                "TYPING_SWEEP_SECS",
                format!("must be between 1 and TYPING_TTL_SECS ({})", self.typing_ttl_secs),
            ));
        }
        if self.auto_close_default_hours == 0
            || self.auto_close_default_hours > MAX_AUTO_CLOSE_HOURS
        {
            return Err(ConfigError::Invalid(
                "AUTO_CLOSE_DEFAULT_HOURS",
                format!("must be between 1 and {MAX_AUTO_CLOSE_HOURS}"),
            ));
        }
        Ok(())
    }

    /// The database URL, required by components that talk to Postgres directly
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect_initial_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: self.reconnect_max_attempts,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_secs(self.typing_ttl_secs)
    }

    pub fn typing_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.typing_sweep_secs)
    }

    pub fn typing_throttle(&self) -> Duration {
        Duration::from_millis(self.typing_throttle_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn auto_close_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.auto_close_refresh_secs)
    }
}

/// Parse an environment variable, falling back to `default` if unset or unparseable
fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Auto-close grace period, read from the settings collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoCloseSettings {
    pub hours: u32,
}

impl AutoCloseSettings {
    /// Read `auto_close_hours`, falling back to `default_hours` when the
    /// setting is unset, unparseable, out of range, or the read fails
    pub async fn resolve(settings: &dyn SettingsStore, default_hours: u32) -> Self {
        let hours = match settings.get_setting(AUTO_CLOSE_HOURS_KEY).await {
            Ok(Some(raw)) => match raw.trim().parse::<u32>() {
                Ok(hours) if (1..=MAX_AUTO_CLOSE_HOURS).contains(&hours) => hours,
                _ => {
                    tracing::warn!(
                        value = %raw,
                        default_hours,
                        "Invalid auto-close setting, using default"
                    );
                    default_hours
                }
            },
            Ok(None) => default_hours,
            Err(e) => {
                tracing::warn!(error = %e, default_hours, "Failed to read auto-close setting");
                default_hours
            }
        };

        Self { hours }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.hours) * 3600)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use helpdesk_shared::InMemoryStore;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "DATABASE_URL",
            "REALTIME_RECONNECT_INITIAL_MS",
            "REALTIME_RECONNECT_MAX_MS",
            "REALTIME_RECONNECT_MAX_ATTEMPTS",
            "TYPING_TTL_SECS",
            "TYPING_SWEEP_SECS",
            "AUTO_CLOSE_DEFAULT_HOURS",
            "LOG_FORMAT",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = Config::from_env().unwrap();

        assert!(config.database_url.is_none());
        assert_eq!(config.typing_ttl(), Duration::from_secs(30));
        assert_eq!(config.typing_sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.dedup_window(), Duration::from_millis(5_000));
        assert_eq!(config.auto_close_default_hours, 24);
        assert_eq!(config.log_format, LogFormat::Pretty);

        let policy = config.reconnect_policy();
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(16));
        assert_eq!(policy.max_attempts, 5);
    }

    #[test]
    #[serial]
    fn test_unparseable_values_fall_back() {
        clear_env();
        env::set_var("TYPING_TTL_SECS", "thirty");
        env::set_var("LOG_FORMAT", "json");

        let config = Config::from_env().unwrap();
        assert_eq!(config.typing_ttl_secs, 30);
        assert_eq!(config.log_format, LogFormat::Json);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_ranges_rejected() {
        clear_env();

        env::set_var("REALTIME_RECONNECT_MAX_ATTEMPTS", "0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("REALTIME_RECONNECT_MAX_ATTEMPTS", _))
        ));
        env::remove_var("REALTIME_RECONNECT_MAX_ATTEMPTS");

        env::set_var("TYPING_SWEEP_SECS", "45");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("TYPING_SWEEP_SECS", _))
        ));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_require_database_url() {
        clear_env();
        let config = Config::from_env().unwrap();
        assert!(matches!(
            config.require_database_url(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
    }

    #[tokio::test]
    async fn test_auto_close_setting_fallbacks() {
        let store = InMemoryStore::new();
        assert_eq!(AutoCloseSettings::resolve(&store, 24).await.hours, 24);

        store.set_setting(AUTO_CLOSE_HOURS_KEY, "48");
        assert_eq!(AutoCloseSettings::resolve(&store, 24).await.hours, 48);

        store.set_setting(AUTO_CLOSE_HOURS_KEY, "two days");
        assert_eq!(AutoCloseSettings::resolve(&store, 24).await.hours, 24);

        store.set_setting(AUTO_CLOSE_HOURS_KEY, "0");
        let settings = AutoCloseSettings::resolve(&store, 24).await;
        assert_eq!(settings.duration(), Duration::from_secs(24 * 3600));
    }

    #[tokio::test]
    async fn test_auto_close_setting_upper_bound() {
        let store = InMemoryStore::new();

        store.set_setting(AUTO_CLOSE_HOURS_KEY, "8760");
        assert_eq!(AutoCloseSettings::resolve(&store, 24).await.hours, 8760);

        store.set_setting(AUTO_CLOSE_HOURS_KEY, "100000000");
        assert_eq!(AutoCloseSettings::resolve(&store, 24).await.hours, 24);
    }

    #[test]
    #[serial]
    fn test_default_auto_close_hours_bounded() {
        clear_env();

        env::set_var("AUTO_CLOSE_DEFAULT_HOURS", "100000000");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("AUTO_CLOSE_DEFAULT_HOURS", _))
        ));

        clear_env();
    }
}
