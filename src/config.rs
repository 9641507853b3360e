// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Environment variable names and defaults used to wire a [`Framework`].
//! Everything except the cache secret has a default.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `OPGUARD_DATA_DIR` | Root for the redb file and audit logs | `/var/lib/opguard` |
//! | `OPGUARD_CACHE_SECRET` | Base64 master secret for cache encryption (≥ 32 bytes) | Required |
//! | `OPGUARD_SHARED_STORE_MAX_BYTES` | Memory budget of the shared store (`0` = unbounded) | `67108864` |
//! | `OPGUARD_CACHE_PRESSURE_THRESHOLD` | `used / max` ratio that triggers the stale sweep | `0.8` |
//! | `OPGUARD_CACHE_SWEEP_INTERVAL_SECS` | Period of the background sweep | `60` |
//! | `OPGUARD_LOCK_TTL_SECS` | Lifetime of a cache stampede lock | `10` |
//! | `OPGUARD_LOCK_RETRY_MS` | Wait between lock attempts | `50` |
//! | `OPGUARD_LOCK_MAX_ATTEMPTS` | Lock attempts before giving up | `100` |
//! | `OPGUARD_RATE_MAX_ATTEMPTS` | Attempts per rate window | `60` |
//! | `OPGUARD_RATE_WINDOW_SECS` | Rate window length | `60` |
//! | `OPGUARD_MAX_FAILURES` | Failures before lockout | `4` |
//! | `OPGUARD_LOCKOUT_SECS` | Lockout cool-down | `900` |
//! | `OPGUARD_RETRY_MAX_ATTEMPTS` | Body attempts on transient storage errors | `3` |
//! | `OPGUARD_RETRY_BASE_MS` | First retry backoff | `100` |
//! | `OPGUARD_MAX_DURATION_SECS` | Ceiling for retry waits (`0` = none) | `30` |
//! | `OPGUARD_LOCKDOWN_ON_CRITICAL` | Lock actor and origin after a critical violation | `false` |
//! | `OPGUARD_JWT_SECRET` | HS256 secret for session tokens | Optional |
//! | `OPGUARD_JWT_ISSUER` | Expected `iss` claim | Optional |
//! | `OPGUARD_WEBHOOK_URL` | Escalation webhook (https, or http on loopback) | Optional |
//! | `OPGUARD_WEBHOOK_SECRET` | HMAC secret for webhook signatures | Required with URL |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |
//!
//! [`Framework`]: crate::state::Framework

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use base64ct::{Base64, Encoding};
use url::Url;

use crate::auth::RateLimitPolicy;
use crate::cache::eviction::DEFAULT_SWEEP_INTERVAL;
use crate::cache::CacheConfig;
use crate::operation::{ExecutorConfig, RetryPolicy};
use crate::storage::paths::DATA_ROOT;
use crate::telemetry::LogFormat;

pub const DATA_DIR_ENV: &str = "OPGUARD_DATA_DIR";

/// Base64 (standard alphabet, padded). Never logged.
pub const CACHE_SECRET_ENV: &str = "OPGUARD_CACHE_SECRET";
pub const SHARED_STORE_MAX_BYTES_ENV: &str = "OPGUARD_SHARED_STORE_MAX_BYTES";
pub const CACHE_PRESSURE_THRESHOLD_ENV: &str = "OPGUARD_CACHE_PRESSURE_THRESHOLD";
pub const CACHE_SWEEP_INTERVAL_ENV: &str = "OPGUARD_CACHE_SWEEP_INTERVAL_SECS";

pub const LOCK_TTL_ENV: &str = "OPGUARD_LOCK_TTL_SECS";
pub const LOCK_RETRY_ENV: &str = "OPGUARD_LOCK_RETRY_MS";
pub const LOCK_MAX_ATTEMPTS_ENV: &str = "OPGUARD_LOCK_MAX_ATTEMPTS";

pub const RATE_MAX_ATTEMPTS_ENV: &str = "OPGUARD_RATE_MAX_ATTEMPTS";
pub const RATE_WINDOW_ENV: &str = "OPGUARD_RATE_WINDOW_SECS";
pub const MAX_FAILURES_ENV: &str = "OPGUARD_MAX_FAILURES";
pub const LOCKOUT_ENV: &str = "OPGUARD_LOCKOUT_SECS";

pub const RETRY_MAX_ATTEMPTS_ENV: &str = "OPGUARD_RETRY_MAX_ATTEMPTS";
pub const RETRY_BASE_ENV: &str = "OPGUARD_RETRY_BASE_MS";
pub const MAX_DURATION_ENV: &str = "OPGUARD_MAX_DURATION_SECS";
pub const LOCKDOWN_ON_CRITICAL_ENV: &str = "OPGUARD_LOCKDOWN_ON_CRITICAL";

pub const JWT_SECRET_ENV: &str = "OPGUARD_JWT_SECRET";
pub const JWT_ISSUER_ENV: &str = "OPGUARD_JWT_ISSUER";

pub const WEBHOOK_URL_ENV: &str = "OPGUARD_WEBHOOK_URL";
pub const WEBHOOK_SECRET_ENV: &str = "OPGUARD_WEBHOOK_SECRET";

pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// 64 MiB.
pub const DEFAULT_SHARED_STORE_MAX_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Clone, PartialEq, Eq)]
pub struct JwtSettings {
    pub secret: Vec<u8>,
    pub issuer: Option<String>,
}

impl std::fmt::Debug for JwtSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSettings")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct WebhookSettings {
    pub url: Url,
    pub secret: Vec<u8>,
}

impl std::fmt::Debug for WebhookSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSettings")
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

/// Everything needed to wire the framework.
#[derive(Clone, PartialEq)]
pub struct FrameworkConfig {
    pub data_dir: PathBuf,
    pub cache_secret: Vec<u8>,
    pub shared_store_max_bytes: usize,
    pub sweep_interval: Duration,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitPolicy,
    pub retry: RetryPolicy,
    pub executor: ExecutorConfig,
    pub jwt: Option<JwtSettings>,
    pub webhook: Option<WebhookSettings>,
    pub log_format: LogFormat,
}

impl std::fmt::Debug for FrameworkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameworkConfig")
            .field("data_dir", &self.data_dir)
            .field("shared_store_max_bytes", &self.shared_store_max_bytes)
            .field("sweep_interval", &self.sweep_interval)
            .field("cache", &self.cache)
            .field("rate_limit", &self.rate_limit)
            .field("retry", &self.retry)
            .field("executor", &self.executor)
            .field("jwt", &self.jwt)
            .field("webhook", &self.webhook)
            .field("log_format", &self.log_format)
            .finish_non_exhaustive()
    }
}

impl FrameworkConfig {
    /// Defaults for everything but the cache secret.
    pub fn with_cache_secret(cache_secret: Vec<u8>) -> Self {
        Self {
            data_dir: PathBuf::from(DATA_ROOT),
            cache_secret,
            shared_store_max_bytes: DEFAULT_SHARED_STORE_MAX_BYTES,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            cache: CacheConfig::default(),
            rate_limit: RateLimitPolicy::default(),
            retry: RetryPolicy::default(),
            executor: ExecutorConfig::default(),
            jwt: None,
            webhook: None,
            log_format: LogFormat::default(),
        }
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let secret = env.get(CACHE_SECRET_ENV).ok_or(ConfigError::Missing(CACHE_SECRET_ENV))?;
        let mut config = Self::with_cache_secret(decode_secret(CACHE_SECRET_ENV, &secret)?);

        if let Some(dir) = env.get(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(bytes) = env.parse(SHARED_STORE_MAX_BYTES_ENV)? {
            config.shared_store_max_bytes = bytes;
        }
        if let Some(secs) = env.parse::<u64>(CACHE_SWEEP_INTERVAL_ENV)? {
            config.sweep_interval = positive_secs(CACHE_SWEEP_INTERVAL_ENV, secs)?;
        }
        if let Some(threshold) = env.parse::<f64>(CACHE_PRESSURE_THRESHOLD_ENV)? {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(ConfigError::Invalid {
                    var: CACHE_PRESSURE_THRESHOLD_ENV,
                    reason: "must be in (0, 1]".to_string(),
                });
            }
            config.cache.memory_pressure_threshold = threshold;
        }

        let lock = &mut config.cache.lock;
        if let Some(secs) = env.parse::<u64>(LOCK_TTL_ENV)? {
            lock.ttl = positive_secs(LOCK_TTL_ENV, secs)?;
        }
        if let Some(ms) = env.parse::<u64>(LOCK_RETRY_ENV)? {
            lock.retry_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = env.parse::<u32>(LOCK_MAX_ATTEMPTS_ENV)? {
            lock.max_attempts = at_least_one(LOCK_MAX_ATTEMPTS_ENV, attempts)?;
        }

        let rate = &mut config.rate_limit;
        if let Some(max) = env.parse::<u64>(RATE_MAX_ATTEMPTS_ENV)? {
            rate.max_attempts = max;
        }
        if let Some(secs) = env.parse::<u64>(RATE_WINDOW_ENV)? {
            rate.window = positive_secs(RATE_WINDOW_ENV, secs)?;
        }
        if let Some(max) = env.parse::<u64>(MAX_FAILURES_ENV)? {
            rate.max_failures = max;
        }
        if let Some(secs) = env.parse::<u64>(LOCKOUT_ENV)? {
            rate.lockout = positive_secs(LOCKOUT_ENV, secs)?;
            config.executor.lockdown_duration = rate.lockout;
        }

        if let Some(attempts) = env.parse::<u32>(RETRY_MAX_ATTEMPTS_ENV)? {
            config.retry.max_attempts = at_least_one(RETRY_MAX_ATTEMPTS_ENV, attempts)?;
        }
        if let Some(ms) = env.parse::<u64>(RETRY_BASE_ENV)? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env.parse::<u64>(MAX_DURATION_ENV)? {
            config.retry.max_duration = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(flag) = env.get(LOCKDOWN_ON_CRITICAL_ENV) {
            config.executor.lockdown_on_critical = parse_bool(LOCKDOWN_ON_CRITICAL_ENV, &flag)?;
        }

        if let Some(secret) = env.get(JWT_SECRET_ENV) {
            config.jwt = Some(JwtSettings {
                secret: secret.into_bytes(),
                issuer: env.get(JWT_ISSUER_ENV),
            });
        }

        if let Some(raw) = env.get(WEBHOOK_URL_ENV) {
            let url = Url::parse(&raw).map_err(|e| ConfigError::Invalid {
                var: WEBHOOK_URL_ENV,
                reason: e.to_string(),
            })?;
            let secret = env
                .get(WEBHOOK_SECRET_ENV)
                .ok_or(ConfigError::Missing(WEBHOOK_SECRET_ENV))?;
            config.webhook = Some(WebhookSettings {
                url,
                secret: secret.into_bytes(),
            });
        }

        if let Some(format) = env.get(LOG_FORMAT_ENV) {
            config.log_format = format.parse()?;
        }

        Ok(config)
    }
}

/// Non-empty values only; blank variables count as unset.
struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(var)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                    var,
                    reason: e.to_string(),
                })
            })
            .transpose()
    }
}

fn decode_secret(var: &'static str, encoded: &str) -> Result<Vec<u8>, ConfigError> {
    Base64::decode_vec(encoded).map_err(|_| ConfigError::Invalid {
        var,
        reason: "not valid base64".to_string(),
    })
}

fn positive_secs(var: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid {
            var,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn at_least_one(var: &'static str, value: u32) -> Result<u32, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            reason: format!("expected a boolean, got '{raw}'"),
        }),
    }
}
