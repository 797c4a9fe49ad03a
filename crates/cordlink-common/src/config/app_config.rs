//! Application configuration structs
//!
//! Loads configuration from environment variables (and a `.env` file when present).

use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app: AppSettings,
    pub bot: BotConfig,
    pub gateway: GatewaySettings,
    pub reconnect: ReconnectConfig,
}

/// General application settings
#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub env: Environment,
}

/// Environment type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    #[must_use]
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

/// Bot credentials and REST settings
#[derive(Clone, Deserialize)]
pub struct BotConfig {
    pub token: String,
    /// Raw intents bitmask; `None` selects the non-privileged default
    #[serde(default)]
    pub intents: Option<u64>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl std::fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConfig")
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .field("api_base", &self.api_base)
            .finish()
    }
}

/// Gateway connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_version")]
    pub version: u8,
    #[serde(default = "default_compress")]
    pub compress: bool,
    /// Peer-silence window as a multiple of the heartbeat interval
    #[serde(default = "default_heartbeat_grace")]
    pub heartbeat_grace: f64,
    /// Fixed slack added to `2 * heartbeat_interval` for the read timeout
    #[serde(default = "default_read_timeout_slack_secs")]
    pub read_timeout_slack_secs: u64,
}

impl GatewaySettings {
    #[must_use]
    pub fn read_timeout_slack(&self) -> Duration {
        Duration::from_secs(self.read_timeout_slack_secs)
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            version: default_gateway_version(),
            compress: default_compress(),
            heartbeat_grace: default_heartbeat_grace(),
            read_timeout_slack_secs: default_read_timeout_slack_secs(),
        }
    }
}

/// Reconnect backoff settings
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// `None` retries forever
    #[serde(default)]
    pub max_attempts: Option<usize>,
}

impl ReconnectConfig {
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: None,
        }
    }
}

// Default value functions
fn default_app_name() -> String {
    "cordlink".to_string()
}

fn default_env() -> Environment {
    Environment::Development
}

fn default_api_base() -> String {
    "https://discord.com/api/v9".to_string()
}

fn default_gateway_version() -> u8 {
    9
}

fn default_compress() -> bool {
    true
}

fn default_heartbeat_grace() -> f64 {
    1.5
}

fn default_read_timeout_slack_secs() -> u64 {
    20
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl AppConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    /// Returns an error if required environment variables are missing or malformed
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            app: AppSettings {
                name: lookup("APP_NAME").unwrap_or_else(default_app_name),
                env: lookup("APP_ENV")
                    .and_then(|s| match s.to_lowercase().as_str() {
                        "production" => Some(Environment::Production),
                        "staging" => Some(Environment::Staging),
                        "development" => Some(Environment::Development),
                        _ => None,
                    })
                    .unwrap_or_default(),
            },
            bot: BotConfig {
                token: lookup("DISCORD_TOKEN")
                    .filter(|t| !t.trim().is_empty())
                    .ok_or(ConfigError::MissingVar("DISCORD_TOKEN"))?,
                intents: parse_optional(&lookup, "DISCORD_INTENTS")?,
                api_base: lookup("DISCORD_API_BASE").unwrap_or_else(default_api_base),
            },
            gateway: GatewaySettings {
                version: parse_optional(&lookup, "GATEWAY_VERSION")?
                    .unwrap_or_else(default_gateway_version),
                compress: parse_optional(&lookup, "GATEWAY_COMPRESS")?
                    .unwrap_or_else(default_compress),
                heartbeat_grace: parse_optional(&lookup, "GATEWAY_HEARTBEAT_GRACE")?
                    .unwrap_or_else(default_heartbeat_grace),
                read_timeout_slack_secs: parse_optional(&lookup, "GATEWAY_READ_TIMEOUT_SLACK_SECS")?
                    .unwrap_or_else(default_read_timeout_slack_secs),
            },
            reconnect: ReconnectConfig {
                initial_delay_ms: parse_optional(&lookup, "RECONNECT_INITIAL_DELAY_MS")?
                    .unwrap_or_else(default_initial_delay_ms),
                max_delay_ms: parse_optional(&lookup, "RECONNECT_MAX_DELAY_MS")?
                    .unwrap_or_else(default_max_delay_ms),
                max_attempts: parse_optional(&lookup, "RECONNECT_MAX_ATTEMPTS")?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // Grace must exceed one full interval
        let grace = self.gateway.heartbeat_grace;
        if grace.is_nan() || grace <= 1.0 {
            return Err(ConfigError::InvalidValue(
                "GATEWAY_HEARTBEAT_GRACE",
                format!("{} (must be greater than 1.0)", self.gateway.heartbeat_grace),
            ));
        }

        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::InvalidValue(
                "RECONNECT_INITIAL_DELAY_MS",
                format!(
                    "{} (exceeds RECONNECT_MAX_DELAY_MS={})",
                    self.reconnect.initial_delay_ms, self.reconnect.max_delay_ms
                ),
            ));
        }

        Ok(())
    }
}

fn parse_optional<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key, raw)),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}
