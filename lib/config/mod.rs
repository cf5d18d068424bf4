use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::backfill::NormalizeSettings;
use crate::checkpoint::CheckpointPolicy;
use crate::event_engine::{BatchPolicy, PollConfig, RetryPolicy};
use crate::marketplace::{MarketplaceClientConfig, RateLimitConfig};

pub const DEFAULT_API_URL: &str = "https://flex-integ-api.sharetribe.com";
pub const DEFAULT_AUTH_URL: &str = "https://flex-integ-api.sharetribe.com";
pub const DEFAULT_CHECKPOINT_DIR: &str = "cache/events";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Process configuration, resolved once at startup.
///
/// Development mode (`APP_ENV=development`) selects ephemeral checkpoints, a short idle
/// wait and the development rate limits. Nothing downstream re-reads the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub development: bool,
    pub marketplace: MarketplaceClientConfig,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_policy: CheckpointPolicy,
    pub poll: PollConfig,
    pub retry_policy: RetryPolicy,
    /// Webhook base URL; `None` runs scripts against the logging sink.
    pub event_sink_url: Option<String>,
    /// Script names to run; empty runs the whole catalog.
    pub enabled_scripts: Vec<String>,
    pub server_port: u16,
    pub normalize: NormalizeSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let development = vars
            .get("APP_ENV")
            .is_some_and(|app_env| app_env.eq_ignore_ascii_case("development"));

        let request_timeout = Duration::from_secs(vars.parse_or("HTTP_TIMEOUT_SECS", 30)?);
        let marketplace = MarketplaceClientConfig {
            api_url: vars
                .get("MARKETPLACE_API_URL")
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            auth_url: vars
                .get("MARKETPLACE_AUTH_URL")
                .unwrap_or_else(|| DEFAULT_AUTH_URL.to_string()),
            client_id: vars.require("MARKETPLACE_CLIENT_ID")?,
            client_secret: vars.require("MARKETPLACE_CLIENT_SECRET")?,
            rate_limits: RateLimitConfig::for_environment(development),
            request_timeout,
        };

        let checkpoint_policy = CheckpointPolicy::from_enabled(!development);
        let default_idle_secs = if development { 30 } else { 5 * 60 };
        let operation_timeout_secs: u64 = vars.parse_or("POLL_OPERATION_TIMEOUT_SECS", 120)?;
        let batch_size: usize = vars.parse_or("EVENTS_BATCH_SIZE", 5)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "EVENTS_BATCH_SIZE",
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
            });
        }

        let poll = PollConfig {
            active_wait: Duration::from_secs(vars.parse_or("POLL_ACTIVE_WAIT_SECS", 3 * 60)?),
            idle_wait: Duration::from_secs(vars.parse_or("POLL_IDLE_WAIT_SECS", default_idle_secs)?),
            checkpoint_enabled: checkpoint_policy == CheckpointPolicy::Persist,
            batch: BatchPolicy {
                batch_size,
                inter_batch_delay: Duration::from_secs(vars.parse_or("EVENTS_BATCH_DELAY_SECS", 90)?),
                continue_on_error: vars.parse_or("BATCH_CONTINUE_ON_ERROR", false)?,
            },
            operation_timeout: (operation_timeout_secs > 0)
                .then(|| Duration::from_secs(operation_timeout_secs)),
        };

        let retry_policy = RetryPolicy::linear(
            vars.parse_or("RETRY_MAX_ATTEMPTS", 3)?,
            Duration::from_millis(vars.parse_or("RETRY_STEP_MS", 1500)?),
        );

        let enabled_scripts = vars
            .get("ENABLED_SCRIPTS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let created_at_end = match vars.get("NORMALIZE_CREATED_AT_END") {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map_err(|err| ConfigError::Invalid {
                        key: "NORMALIZE_CREATED_AT_END",
                        value: raw.clone(),
                        reason: err.to_string(),
                    })?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        let normalize = NormalizeSettings {
            concurrency: vars.parse_or("NORMALIZE_CONCURRENCY", 5)?,
            created_at_end,
            retry_policy,
            ..NormalizeSettings::default()
        };

        Ok(Self {
            development,
            marketplace,
            checkpoint_dir: vars
                .get("CHECKPOINT_DIR")
                .map_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT_DIR), PathBuf::from),
            checkpoint_policy,
            poll,
            retry_policy,
            event_sink_url: vars.get("EVENT_SINK_URL"),
            enabled_scripts,
            server_port: vars.parse_or("PORT", 3000)?,
            normalize,
        })
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank values both read as absent.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn require(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: err.to_string(),
            }),
            None => Ok(default),
        }
    }
}
