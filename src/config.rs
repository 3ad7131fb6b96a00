use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::HashSet,
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::{
    error::{AdmissionError, AdmissionResult},
    ratelimit::FailurePolicy,
};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub admission_config_path: Option<PathBuf>,
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "compact" | "text" => Ok(Self::Compact),
            _ => Err(format!("unsupported log format: {s}")),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        Ok(Self {
            bind_addr,
            admission_config_path: env::var("ADMISSION_CONFIG")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: env_parse("LOG_FORMAT", LogFormat::Compact),
        })
    }
}

/// Storages, rate limiters and upstreams consumed by the admission core.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionConfig {
    #[serde(default)]
    pub storages: Vec<StorageConfig>,
    #[serde(default)]
    pub rate_limiters: RateLimitersConfig,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StorageKind,
    #[serde(default)]
    pub redis: Option<RedisStorageConfig>,
    #[serde(default)]
    pub postgres: Option<PostgresStorageConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Redis,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisStorageConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresStorageConfig {
    pub connection_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitersConfig {
    #[serde(default)]
    pub engines: Vec<EngineConfig>,
    #[serde(default)]
    pub budgets: Vec<BudgetGroupConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EngineKind,
    #[serde(default)]
    pub redis: Option<RedisEngineConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisEngineConfig {
    pub storage_name: String,
    #[serde(
        default = "default_redis_timeout",
        deserialize_with = "duration_format::deserialize"
    )]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetGroupConfig {
    #[serde(default)]
    pub default_engine: Option<String>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub budgets: Vec<BudgetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetConfig {
    pub name: String,
    #[serde(default, alias = "storage")]
    pub engine: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    pub requests: u32,
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub period: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    pub id: String,
    #[serde(default)]
    pub rate_limit_budget: Option<String>,
    #[serde(default)]
    pub auto_tune: Option<AutoTuneConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoTuneConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(
        default = "default_auto_tune_period",
        deserialize_with = "duration_format::deserialize"
    )]
    pub period: Duration,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: f64,
    #[serde(default = "default_init_rate_limit")]
    pub init_rate_limit: u32,
    #[serde(
        default = "default_init_rate_limit_period",
        deserialize_with = "duration_format::deserialize"
    )]
    pub init_rate_limit_period: Duration,
}

impl Default for AutoTuneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period: default_auto_tune_period(),
            error_threshold: default_error_threshold(),
            init_rate_limit: default_init_rate_limit(),
            init_rate_limit_period: default_init_rate_limit_period(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_redis_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_auto_tune_period() -> Duration {
    Duration::from_secs(60)
}

fn default_error_threshold() -> f64 {
    0.1
}

fn default_init_rate_limit() -> u32 {
    1000
}

fn default_init_rate_limit_period() -> Duration {
    Duration::from_secs(1)
}

impl AdmissionConfig {
    pub fn from_json_str(raw: &str) -> AdmissionResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| AdmissionError::InvalidConfig(format!("malformed json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> AdmissionResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AdmissionError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// Rejects anything that would leave the admission policy ambiguous.
    pub fn validate(&self) -> AdmissionResult<()> {
        let mut storages = HashSet::new();
        for storage in &self.storages {
            ensure_unique(&mut storages, "storage", &storage.name)?;
            match storage.kind {
                StorageKind::Redis if storage.redis.is_none() => {
                    return Err(AdmissionError::InvalidConfig(format!(
                        "redis storage {} has no redis section",
                        storage.name
                    )));
                }
                StorageKind::Postgres if storage.postgres.is_none() => {
                    return Err(AdmissionError::InvalidConfig(format!(
                        "postgres storage {} has no postgres section",
                        storage.name
                    )));
                }
                _ => {}
            }
        }

        let mut engines = HashSet::new();
        for engine in &self.rate_limiters.engines {
            ensure_unique(&mut engines, "engine", &engine.name)?;
            if engine.kind == EngineKind::Redis {
                let Some(redis) = &engine.redis else {
                    return Err(AdmissionError::InvalidConfig(format!(
                        "redis engine {} has no redis section",
                        engine.name
                    )));
                };
                if redis.timeout.is_zero() {
                    return Err(AdmissionError::InvalidConfig(format!(
                        "redis engine {} timeout must be > 0",
                        engine.name
                    )));
                }
            }
        }

        let mut budgets = HashSet::new();
        for group in &self.rate_limiters.budgets {
            for budget in &group.budgets {
                ensure_unique(&mut budgets, "budget", &budget.name)?;
                for (index, rule) in budget.rules.iter().enumerate() {
                    rule.validate(&budget.name, index)?;
                }
            }
        }

        let mut upstreams = HashSet::new();
        for upstream in &self.upstreams {
            ensure_unique(&mut upstreams, "upstream", &upstream.id)?;
            if let Some(auto_tune) = &upstream.auto_tune {
                auto_tune.validate(&upstream.id)?;
            }
        }

        Ok(())
    }
}

impl RuleConfig {
    pub fn validate(&self, budget: &str, index: usize) -> AdmissionResult<()> {
        let invalid = |reason: &str| AdmissionError::InvalidRule {
            budget: budget.to_string(),
            index,
            reason: reason.to_string(),
        };

        match (&self.method, &self.pattern) {
            (Some(_), Some(_)) => return Err(invalid("both method and pattern are set")),
            (None, None) => return Err(invalid("one of method or pattern is required")),
            (Some(method), None) if method.is_empty() => return Err(invalid("method is empty")),
            (None, Some(pattern)) => {
                Regex::new(pattern)?;
            }
            _ => {}
        }

        if self.requests == 0 {
            return Err(invalid("requests must be > 0"));
        }
        if self.period.is_zero() {
            return Err(invalid("period must be > 0"));
        }
        Ok(())
    }
}

impl AutoTuneConfig {
    pub fn validate(&self, upstream: &str) -> AdmissionResult<()> {
        let invalid =
            |reason: &str| AdmissionError::InvalidConfig(format!("auto-tune of {upstream}: {reason}"));

        if self.period.is_zero() {
            return Err(invalid("period must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.error_threshold) {
            return Err(invalid("errorThreshold must be within [0, 1]"));
        }
        if self.init_rate_limit == 0 {
            return Err(invalid("initRateLimit must be > 0"));
        }
        if self.init_rate_limit_period.is_zero() || self.init_rate_limit_period > self.period {
            return Err(invalid("initRateLimitPeriod must be > 0 and <= period"));
        }
        Ok(())
    }
}

fn ensure_unique(
    seen: &mut HashSet<String>,
    kind: &'static str,
    name: &str,
) -> AdmissionResult<()> {
    if seen.insert(name.to_string()) {
        Ok(())
    } else {
        Err(AdmissionError::DuplicateName {
            kind,
            name: name.to_string(),
        })
    }
}

/// Parses `250ms`, `1s`, `5m`, `1h`, or bare milliseconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value = digits
        .parse::<u64>()
        .map_err(|_| format!("invalid duration: {raw:?}"))?;

    let secs = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration out of range: {raw:?}"))
    };

    match unit.trim() {
        "" | "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => secs(60),
        "h" => secs(3600),
        other => Err(format!("unsupported duration unit {other:?} in {raw:?}")),
    }
}

mod duration_format {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Millis(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Millis(ms) => Ok(Duration::from_millis(ms)),
            RawDuration::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
