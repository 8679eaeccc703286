//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are loaded from GEMINI_API_KEY_1..GEMINI_API_KEY_10 (or
//! GEMINI_API_KEY) or from keys_file, never stored in the TOML directly.

use chrono::TimeDelta;
use common::Secret;
use key_pool::{PoolConfig, QuotaConfig, RetryPolicy};
use provider::HttpProviderConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Highest numbered `GEMINI_API_KEY_<n>` variable that is read.
const MAX_NUMBERED_KEYS: usize = 10;

const MAX_COOLDOWN_SECS: u64 = 30 * 24 * 3600;
const MAX_MIN_INTERVAL_SECS: u64 = 24 * 3600;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub quota: QuotaSection,
    #[serde(default)]
    pub retry: RetrySection,
    /// Resolved at load time from env vars or `pool.keys_file`.
    #[serde(skip)]
    pub credentials: Vec<Secret<String>>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long in-flight requests may take to finish after a shutdown signal.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

/// Generation endpoint settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// File with one API key per line (`#` starts a comment line).
    pub keys_file: Option<PathBuf>,
    pub cooldown_secs: u64,
    pub failure_threshold: u32,
    pub fail_open: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct QuotaSection {
    pub daily_limit: u32,
    pub min_interval_secs: u64,
    /// JSON file for quota records. In-memory when unset.
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub max_retry_delay_secs: u64,
}

fn default_max_connections() -> usize {
    256
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_api_key_header() -> String {
    provider::http::DEFAULT_API_KEY_HEADER.to_string()
}

fn default_timeout() -> u64 {
    60
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            keys_file: None,
            cooldown_secs: 300,
            failure_threshold: 3,
            fail_open: true,
        }
    }
}

impl Default for QuotaSection {
    fn default() -> Self {
        Self {
            daily_limit: 5,
            min_interval_secs: 120,
            store_path: None,
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            max_retry_delay_secs: 5,
        }
    }
}

impl PoolSection {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            cooldown: TimeDelta::seconds(self.cooldown_secs as i64),
            failure_threshold: self.failure_threshold,
            fail_open: self.fail_open,
        }
    }
}

impl QuotaSection {
    pub fn to_quota_config(&self) -> QuotaConfig {
        QuotaConfig {
            daily_limit: self.daily_limit,
            min_interval: TimeDelta::seconds(self.min_interval_secs as i64),
        }
    }
}

impl RetrySection {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            max_retry_delay: Duration::from_secs(self.max_retry_delay_secs),
        }
    }
}

impl UpstreamConfig {
    pub fn to_provider_config(&self) -> HttpProviderConfig {
        HttpProviderConfig {
            endpoint: self.url.clone(),
            api_key_header: self.api_key_header.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then resolve API keys.
    ///
    /// Key resolution order:
    /// 1. GEMINI_API_KEY_1 .. GEMINI_API_KEY_10
    /// 2. GEMINI_API_KEY
    /// 3. keys_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;
        config.credentials = load_credentials(config.pool.keys_file.as_deref())?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.upstream.url.starts_with("http://") && !self.upstream.url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "upstream.url must start with http:// or https://, got: {}",
                self.upstream.url
            )));
        }

        let nonzero = [
            ("upstream.timeout_secs", self.upstream.timeout_secs),
            ("server.max_connections", self.server.max_connections as u64),
            ("server.drain_timeout_secs", self.server.drain_timeout_secs),
            ("pool.cooldown_secs", self.pool.cooldown_secs),
            ("pool.failure_threshold", u64::from(self.pool.failure_threshold)),
            ("quota.daily_limit", u64::from(self.quota.daily_limit)),
            ("retry.max_attempts", u64::from(self.retry.max_attempts)),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.pool.cooldown_secs > MAX_COOLDOWN_SECS {
            return Err(common::Error::Config(format!(
                "pool.cooldown_secs must be at most {MAX_COOLDOWN_SECS}"
            )));
        }
        if self.quota.min_interval_secs > MAX_MIN_INTERVAL_SECS {
            return Err(common::Error::Config(format!(
                "quota.min_interval_secs must be at most {MAX_MIN_INTERVAL_SECS}"
            )));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("gen-gateway.toml")
    }
}

/// Collect API keys: env vars win over the keys file. Duplicates are dropped.
fn load_credentials(keys_file: Option<&Path>) -> common::Result<Vec<Secret<String>>> {
    let mut keys: Vec<String> = (1..=MAX_NUMBERED_KEYS)
        .filter_map(|i| std::env::var(format!("GEMINI_API_KEY_{i}")).ok())
        .map(|k| k.trim().to_owned())
        .filter(|k| !k.is_empty())
        .collect();

    if keys.is_empty() {
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            let key = key.trim().to_owned();
            if !key.is_empty() {
                keys.push(key);
            }
        }
    }

    if keys.is_empty() {
        if let Some(path) = keys_file {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read keys_file {}: {e}",
                    path.display()
                ))
            })?;
            keys = contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_owned)
                .collect();
        }
    }

    let before = keys.len();
    let mut seen = std::collections::HashSet::new();
    keys.retain(|k| seen.insert(k.clone()));
    if keys.len() < before {
        warn!(dropped = before - keys.len(), "duplicate API keys ignored");
    }

    if keys.is_empty() {
        return Err(common::Error::NoCredentials(
            "set GEMINI_API_KEY_1..GEMINI_API_KEY_10, GEMINI_API_KEY, or pool.keys_file".into(),
        ));
    }

    Ok(keys.into_iter().map(Secret::new).collect())
}
