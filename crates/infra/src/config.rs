//! Worker configuration from `MEDIAFORGE_*` environment variables.

use core::str::FromStr;
use std::path::PathBuf;
use std::time::Duration;

use mediaforge_observability::LogFormat;

use crate::jobs::{BackoffStrategy, RetryPolicy};

pub const ENV_PREFIX: &str = "MEDIAFORGE_";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("{0} must be set")]
    Missing(String),
}

/// Which generation provider the worker drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    /// Built-in provider returning a fixed payload after `delay`.
    Dummy { delay: Duration },
    Http { endpoint: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Postgres URL; unset means in-memory job store and audit log.
    pub database_url: Option<String>,
    /// Redis URL; unset means the in-process timer scheduler.
    pub redis_url: Option<String>,
    pub retry_policy: RetryPolicy,
    pub generation_timeout: Option<Duration>,
    pub provider: ProviderKind,
    /// Directory for results; unset means in-memory results.
    pub result_dir: Option<PathBuf>,
    pub result_url_ttl: Duration,
    pub concurrency: usize,
    pub log_format: LogFormat,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            retry_policy: RetryPolicy::default(),
            generation_timeout: None,
            provider: ProviderKind::Dummy {
                delay: Duration::ZERO,
            },
            result_dir: None,
            result_url_ttl: Duration::from_secs(3600),
            concurrency: 4,
            log_format: LogFormat::Json,
        }
    }
}

impl WorkerConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve full variable names (e.g. `MEDIAFORGE_MAX_RETRIES`).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = Self::default();

        let max_retries: u32 = env
            .parse("MAX_RETRIES")?
            .unwrap_or(defaults.retry_policy.max_retries);
        if max_retries == 0 {
            return Err(env.invalid("MAX_RETRIES", "0", "must be at least 1"));
        }
        let base_delay = env
            .parse::<u64>("BASE_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_policy.base_delay);
        if base_delay.is_zero() {
            return Err(env.invalid("BASE_DELAY_MS", "0", "must be at least 1"));
        }
        let max_delay = env
            .parse::<u64>("MAX_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_policy.max_delay);

        let provider = match env.get("PROVIDER").as_deref().map(str::trim) {
            None | Some("dummy") => ProviderKind::Dummy {
                delay: env
                    .parse::<u64>("DUMMY_DELAY_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(Duration::ZERO),
            },
            Some("http") => ProviderKind::Http {
                endpoint: env
                    .get("PROVIDER_URL")
                    .ok_or_else(|| ConfigError::Missing(format!("{ENV_PREFIX}PROVIDER_URL")))?,
            },
            Some(other) => {
                return Err(env.invalid("PROVIDER", other, "expected `dummy` or `http`"));
            }
        };

        let concurrency: usize = env.parse("CONCURRENCY")?.unwrap_or(defaults.concurrency);
        if concurrency == 0 {
            return Err(env.invalid("CONCURRENCY", "0", "must be at least 1"));
        }

        Ok(Self {
            database_url: env.get("DATABASE_URL"),
            redis_url: env.get("REDIS_URL"),
            retry_policy: RetryPolicy {
                max_retries,
                base_delay,
                max_delay,
                strategy: BackoffStrategy::Exponential,
            },
            generation_timeout: env
                .parse::<u64>("GENERATION_TIMEOUT_SECS")?
                .map(Duration::from_secs),
            provider,
            result_dir: env.get("RESULT_DIR").map(PathBuf::from),
            result_url_ttl: env
                .parse::<u64>("RESULT_URL_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.result_url_ttl),
            concurrency,
            log_format: env.parse("LOG_FORMAT")?.unwrap_or(defaults.log_format),
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty value of `MEDIAFORGE_<key>`.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}")).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|e| self.invalid(key, &raw, e.to_string()))
            })
            .transpose()
    }

    fn invalid(&self, key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            key: format!("{ENV_PREFIX}{key}"),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}
