use std::{env, fmt, net::SocketAddr, time::Duration};

use url::Url;

use super::{database_url, server_bind_address};

const DEFAULT_TWITCH_API_BASE: &str = "https://api.twitch.tv/helix/";
const DEFAULT_TWITCH_OAUTH_BASE: &str = "https://id.twitch.tv/oauth2/";
const DEFAULT_DISCORD_API_BASE: &str = "https://discord.com/api/v10/";

const DEFAULT_FANOUT_CONCURRENCY: u64 = 8;
const DEFAULT_RATE_LIMIT_BUDGET_SECS: u64 = 30;
const DEFAULT_CLAIM_RETENTION_DAYS: u64 = 30;
const DEFAULT_DEDUP_RETENTION_SECS: u64 = 15 * 60;
const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 60;
const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// EventSub requires secrets between 10 and 100 ASCII characters.
const WEBHOOK_SECRET_MIN_LEN: usize = 10;
const WEBHOOK_SECRET_MAX_LEN: usize = 100;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Credentials and endpoints for the upstream event source.
#[derive(Clone)]
pub struct TwitchConfig {
    pub webhook_secret: String,
    pub client_id: String,
    pub client_secret: String,
    pub api_base: Url,
    pub oauth_base: Url,
}

impl fmt::Debug for TwitchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwitchConfig")
            .field("client_id", &self.client_id)
            .field("api_base", &self.api_base.as_str())
            .field("oauth_base", &self.oauth_base.as_str())
            .finish_non_exhaustive()
    }
}

/// Credentials and limits for the chat platform sender.
#[derive(Clone)]
pub struct DiscordConfig {
    pub bot_token: String,
    pub api_base: Url,
    pub rate_limit_budget: Duration,
}

impl fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("api_base", &self.api_base.as_str())
            .field("rate_limit_budget", &self.rate_limit_budget)
            .finish_non_exhaustive()
    }
}

/// Retention windows and sweep cadence for background maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    pub claim_retention: Duration,
    pub dedup_retention: Duration,
    pub maintenance_interval: Duration,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub twitch: TwitchConfig,
    pub discord: DiscordConfig,
    pub fanout_concurrency: usize,
    pub retention: RetentionConfig,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let webhook_secret = required("TWITCH_WEBHOOK_SECRET")?;
        if !(WEBHOOK_SECRET_MIN_LEN..=WEBHOOK_SECRET_MAX_LEN).contains(&webhook_secret.len()) {
            return Err(ConfigError::WebhookSecretLength(webhook_secret.len()));
        }

        let twitch = TwitchConfig {
            webhook_secret,
            client_id: required("TWITCH_CLIENT_ID")?,
            client_secret: required("TWITCH_CLIENT_SECRET")?,
            api_base: base_url("TWITCH_API_BASE", DEFAULT_TWITCH_API_BASE)?,
            oauth_base: base_url("TWITCH_OAUTH_BASE", DEFAULT_TWITCH_OAUTH_BASE)?,
        };

        let discord = DiscordConfig {
            bot_token: required("DISCORD_BOT_TOKEN")?,
            api_base: base_url("DISCORD_API_BASE", DEFAULT_DISCORD_API_BASE)?,
            rate_limit_budget: Duration::from_secs(number(
                "DISCORD_RATE_LIMIT_BUDGET_SECS",
                DEFAULT_RATE_LIMIT_BUDGET_SECS,
            )?),
        };

        let fanout_concurrency = number("FANOUT_CONCURRENCY", DEFAULT_FANOUT_CONCURRENCY)?;
        if fanout_concurrency == 0 {
            return Err(ConfigError::InvalidNumber {
                name: "FANOUT_CONCURRENCY",
                value: "0".to_string(),
            });
        }

        let claim_days = number("CLAIM_RETENTION_DAYS", DEFAULT_CLAIM_RETENTION_DAYS)?;
        let claim_secs =
            claim_days
                .checked_mul(SECS_PER_DAY)
                .ok_or_else(|| ConfigError::InvalidNumber {
                    name: "CLAIM_RETENTION_DAYS",
                    value: claim_days.to_string(),
                })?;

        let retention = RetentionConfig {
            claim_retention: Duration::from_secs(claim_secs),
            dedup_retention: Duration::from_secs(number(
                "DEDUP_RETENTION_SECS",
                DEFAULT_DEDUP_RETENTION_SECS,
            )?),
            maintenance_interval: Duration::from_secs(
                number(
                    "MAINTENANCE_INTERVAL_SECS",
                    DEFAULT_MAINTENANCE_INTERVAL_SECS,
                )?
                .max(1),
            ),
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url: database_url(),
            twitch,
            discord,
            fanout_concurrency: fanout_concurrency as usize,
            retention,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn number(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
            name,
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

fn base_url(name: &'static str, default: &str) -> Result<Url, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    // Url::join drops the last path segment unless the base ends with '/'.
    let normalized = if raw.ends_with('/') {
        raw
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).map_err(|err| ConfigError::InvalidUrl {
        name,
        reason: err.to_string(),
    })
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    Missing(&'static str),
    InvalidNumber { name: &'static str, value: String },
    InvalidUrl { name: &'static str, reason: String },
    WebhookSecretLength(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::Missing(name) => write!(f, "{name} must be set"),
            Self::InvalidNumber { name, value } => {
                write!(f, "{name} must be a positive integer (got {value})")
            }
            Self::InvalidUrl { name, reason } => write!(f, "invalid {name} value: {reason}"),
            Self::WebhookSecretLength(len) => write!(
                f,
                "TWITCH_WEBHOOK_SECRET must be between {WEBHOOK_SECRET_MIN_LEN} and {WEBHOOK_SECRET_MAX_LEN} bytes (got {len})"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ENV_GUARD;
    use crate::DEFAULT_BIND_ADDR;

    const MANAGED_VARS: &[&str] = &[
        "APP_ENV",
        "APP_BIND_ADDR",
        "DATABASE_URL",
        "TWITCH_WEBHOOK_SECRET",
        "TWITCH_CLIENT_ID",
        "TWITCH_CLIENT_SECRET",
        "TWITCH_API_BASE",
        "TWITCH_OAUTH_BASE",
        "DISCORD_BOT_TOKEN",
        "DISCORD_API_BASE",
        "DISCORD_RATE_LIMIT_BUDGET_SECS",
        "FANOUT_CONCURRENCY",
        "CLAIM_RETENTION_DAYS",
        "DEDUP_RETENTION_SECS",
        "MAINTENANCE_INTERVAL_SECS",
    ];

    fn reset_env() {
        for name in MANAGED_VARS {
            env::remove_var(name);
        }
    }

    fn set_required() {
        env::set_var("TWITCH_WEBHOOK_SECRET", "super-secret-value");
        env::set_var("TWITCH_CLIENT_ID", "client");
        env::set_var("TWITCH_CLIENT_SECRET", "client-secret");
        env::set_var("DISCORD_BOT_TOKEN", "bot-token");
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        reset_env();
        set_required();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.fanout_concurrency, 8);
        assert_eq!(config.retention.dedup_retention, Duration::from_secs(900));
        assert_eq!(
            config.retention.claim_retention,
            Duration::from_secs(30 * 24 * 60 * 60)
        );
        assert_eq!(config.twitch.api_base.as_str(), DEFAULT_TWITCH_API_BASE);
        assert_eq!(config.discord.rate_limit_budget, Duration::from_secs(30));

        reset_env();
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        reset_env();
        set_required();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        reset_env();
    }

    #[test]
    fn requires_webhook_secret() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        reset_env();
        set_required();
        env::remove_var("TWITCH_WEBHOOK_SECRET");

        let err = AppConfig::from_env().expect_err("missing secret should error");
        assert!(matches!(err, ConfigError::Missing("TWITCH_WEBHOOK_SECRET")));

        env::set_var("TWITCH_WEBHOOK_SECRET", "short");
        let err = AppConfig::from_env().expect_err("short secret should error");
        assert!(matches!(err, ConfigError::WebhookSecretLength(5)));

        reset_env();
    }

    #[test]
    fn rejects_retention_that_overflows() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        reset_env();
        set_required();
        env::set_var("CLAIM_RETENTION_DAYS", u64::MAX.to_string());

        let err = AppConfig::from_env().expect_err("overflowing retention should error");
        assert!(matches!(
            err,
            ConfigError::InvalidNumber {
                name: "CLAIM_RETENTION_DAYS",
                ..
            }
        ));

        reset_env();
    }

    #[test]
    fn rejects_zero_concurrency() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        reset_env();
        set_required();
        env::set_var("FANOUT_CONCURRENCY", "0");

        let err = AppConfig::from_env().expect_err("zero concurrency should error");
        assert!(matches!(
            err,
            ConfigError::InvalidNumber {
                name: "FANOUT_CONCURRENCY",
                ..
            }
        ));

        reset_env();
    }

    #[test]
    fn parses_production_environment_and_normalizes_base_urls() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        reset_env();
        set_required();
        env::set_var("APP_ENV", "production");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        env::set_var("DISCORD_API_BASE", "http://localhost:4000/api");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(
            config.discord.api_base.as_str(),
            "http://localhost:4000/api/"
        );

        reset_env();
    }

    #[test]
    fn debug_output_hides_secrets() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        reset_env();
        set_required();

        let config = AppConfig::from_env().expect("config should load");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret-value"));
        assert!(!rendered.contains("bot-token"));

        reset_env();
    }
}
