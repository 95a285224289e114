//! Configuration module for the bundle engine
//!
//! This module handles configuration loading from TOML files and
//! `BUNDLE_ENGINE_*` environment variables. Every section has defaults, so
//! an empty file is a valid configuration.

use crate::circuit_breaker::BreakerConfig;
use crate::errors::{EngineError, EngineResult};
use crate::planner::{FeePolicy, TimingPolicy};
use crate::queue::QueueConfig;
use crate::retry::RetryConfig;
use crate::scheduler::SchedulerConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "BUNDLE_ENGINE_";

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ledger endpoint configuration
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Task queue backend selection and failover
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker pools and coordination
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Task retry backoff
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    /// Default timing policy of launched bundles
    #[serde(default)]
    pub timing: TimingPolicy,

    /// Default fee policy of launched bundles
    #[serde(default)]
    pub fees: FeePolicy,

    #[serde(default)]
    pub accounts: AccountsConfig,

    /// Monitoring and metrics
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Planner RNG seed; entropy when unset
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Endpoint name, also the circuit breaker key
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Bound on the launch-time health probe
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,

    /// Behaviour of the simulated ledger in simulation mode
    #[serde(default)]
    pub simulated: SimulatedLedgerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedLedgerConfig {
    #[serde(default = "default_sim_latency_ms")]
    pub latency_ms: u64,

    /// Share of submissions failing with a transient network error
    #[serde(default = "default_sim_failure_rate")]
    pub failure_rate: f64,

    #[serde(default = "default_sim_fee_rate")]
    pub fee_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountsConfig {
    /// Accounts below this balance are not scheduled
    #[serde(default = "default_min_account_balance")]
    pub min_account_balance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Default log filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub json_logs: bool,

    /// Period of the per-bundle analytics refresh
    #[serde(default = "default_analytics_refresh_ms")]
    pub analytics_refresh_ms: u64,

    /// Buffer of the event bus; slower subscribers lag
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Default page size of bundle history queries
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

// Default value functions
fn default_endpoint() -> String { "primary".to_string() }
fn default_health_check_timeout_ms() -> u64 { 5_000 }
fn default_sim_latency_ms() -> u64 { 150 }
fn default_sim_failure_rate() -> f64 { 0.1 }
fn default_sim_fee_rate() -> f64 { 30.0 }
fn default_min_account_balance() -> u64 { 10_000 }
fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_analytics_refresh_ms() -> u64 { 5_000 }
fn default_event_capacity() -> usize { 1_024 }
fn default_history_limit() -> usize { 50 }

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            simulated: SimulatedLedgerConfig::default(),
        }
    }
}

impl Default for SimulatedLedgerConfig {
    fn default() -> Self {
        Self {
            latency_ms: default_sim_latency_ms(),
            failure_rate: default_sim_failure_rate(),
            fee_rate: default_sim_fee_rate(),
        }
    }
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            min_account_balance: default_min_account_balance(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: default_true(),
            log_level: default_log_level(),
            json_logs: false,
            analytics_refresh_ms: default_analytics_refresh_ms(),
            event_capacity: default_event_capacity(),
            history_limit: default_history_limit(),
        }
    }
}

fn parse_env<T>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("invalid value for {ENV_PREFIX}{key}: {e}"))
}

impl EngineConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration with `.env` and environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, which receives keys without the prefix
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LEDGER_ENDPOINT") {
            self.ledger.endpoint = v;
        }
        if let Some(v) = lookup("DURABLE_QUEUE") {
            self.queue.durable_enabled = parse_env("DURABLE_QUEUE", &v)?;
        }
        if let Some(v) = lookup("REDIS_URL") {
            self.queue.redis_url = v;
        }
        if let Some(v) = lookup("CONCURRENCY") {
            self.scheduler.concurrency = parse_env("CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("MIN_ACCOUNT_BALANCE") {
            self.accounts.min_account_balance = parse_env("MIN_ACCOUNT_BALANCE", &v)?;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.monitoring.log_level = v;
        }
        if let Some(v) = lookup("JSON_LOGS") {
            self.monitoring.json_logs = parse_env("JSON_LOGS", &v)?;
        }
        if let Some(v) = lookup("SEED") {
            self.seed = Some(parse_env("SEED", &v)?);
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> EngineResult<()> {
        self.timing.validate()?;
        self.fees.validate()?;

        if self.scheduler.concurrency == 0 {
            return Err(EngineError::Config(
                "scheduler.concurrency must be at least 1".to_string(),
            ));
        }
        if self.scheduler.coordination_interval_ms == 0 {
            return Err(EngineError::Config(
                "scheduler.coordination_interval_ms must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(EngineError::Config(format!(
                "retry.jitter_factor must be within 0..=1, got {}",
                self.retry.jitter_factor
            )));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(EngineError::Config(
                "retry.base_backoff_ms exceeds retry.max_backoff_ms".to_string(),
            ));
        }
        if self.queue.failover_threshold == 0 {
            return Err(EngineError::Config(
                "queue.failover_threshold must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0
            || self.circuit_breaker.success_threshold == 0
        {
            return Err(EngineError::Config(
                "circuit_breaker thresholds must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.ledger.simulated.failure_rate) {
            return Err(EngineError::Config(
                "ledger.simulated.failure_rate must be within 0..=1".to_string(),
            ));
        }
        Ok(())
    }
}
