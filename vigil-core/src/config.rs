//! Configuration for the Vigil engine.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! explicit config file -> `.env` -> environment. The user config lives in
//! `config.toml` under the platform config directory (`~/.config/vigil/` on
//! Linux).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::threat::IndicatorKind;

/// Top-level configuration for a threat engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of entity shards processed in parallel.
    pub workers: usize,
    /// Bounded ingest queue depth per shard. Submitters wait when it is full.
    pub queue_capacity: usize,
    pub correlation: CorrelationConfig,
    pub scoring: ScoringConfig,
    pub dispatch: DispatchConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            correlation: CorrelationConfig::default(),
            scoring: ScoringConfig::default(),
            dispatch: DispatchConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Human-readable warnings about settings that will behave poorly.
    /// Never fails; the engine clamps what it must.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.workers == 0 {
            warnings.push("workers is 0; one shard will be used".to_string());
        }
        if self.queue_capacity == 0 {
            warnings.push("queue_capacity is 0; a capacity of 1 will be used".to_string());
        }
        if self.correlation.window_secs == 0 {
            warnings.push(
                "correlation.window_secs is 0; only simultaneous observations will correlate"
                    .to_string(),
            );
        }
        if self.correlation.quiet_period_secs < self.correlation.window_secs {
            warnings.push(format!(
                "correlation.quiet_period_secs ({}) is shorter than window_secs ({}); incidents may close before the window elapses",
                self.correlation.quiet_period_secs, self.correlation.window_secs
            ));
        }
        if self.correlation.sweep_interval_secs == 0 {
            warnings.push("correlation.sweep_interval_secs is 0; background sweeping is disabled".to_string());
        }
        for (name, policy) in [("normal", &self.dispatch.normal), ("urgent", &self.dispatch.urgent)] {
            warnings.extend(policy.validate(name));
        }
        if self.dispatch.max_concurrent == 0 {
            warnings.push("dispatch.max_concurrent is 0; a limit of 1 will be used".to_string());
        }
        if self.dispatch.attempt_timeout_ms == 0 {
            warnings.push("dispatch.attempt_timeout_ms is 0; every attempt will time out".to_string());
        }
        for (kind, weight) in self.scoring.weights.iter() {
            if !weight.is_finite() || weight < 0.0 {
                warnings.push(format!("scoring.weights.{kind} is {weight}; indicators of this kind will be rejected"));
            }
        }
        if self.persistence.enabled && self.persistence.dir.as_os_str().is_empty() {
            warnings.push("persistence is enabled but persistence.dir is empty".to_string());
        }
        warnings
    }
}

/// Incident correlation and lifecycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Observations for the same entity within this many seconds of the
    /// incident's last observation join it.
    pub window_secs: u64,
    /// An open incident with no new observations for this long is closed.
    pub quiet_period_secs: u64,
    /// How often the background sweeper checks for quiet incidents.
    /// 0 disables the sweeper.
    pub sweep_interval_secs: u64,
    /// Closed incidents whose actions have all finished are dropped from
    /// memory this long after closing. Their snapshots stay in the store.
    /// 0 keeps them in memory indefinitely.
    pub retain_closed_secs: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            window_secs: 900,
            quiet_period_secs: 3600,
            sweep_interval_secs: 60,
            retain_closed_secs: 86_400,
        }
    }
}

/// Which scoring function the engine uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringStrategy {
    /// `1 - exp(-sum(weights))` with corroboration-adjusted confidence.
    #[default]
    Saturating,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub strategy: ScoringStrategy,
    pub weights: IndicatorWeights,
    /// IPv4 addresses with known-bad reputation.
    pub reputation_blocklist: Vec<String>,
}

/// Static per-kind weights used by the built-in extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorWeights {
    pub keyword: f64,
    pub ip_reputation: f64,
    pub pattern: f64,
    pub behavioral_anomaly: f64,
}

impl Default for IndicatorWeights {
    fn default() -> Self {
        Self {
            keyword: 0.4,
            ip_reputation: 1.2,
            pattern: 0.9,
            behavioral_anomaly: 0.8,
        }
    }
}

impl IndicatorWeights {
    pub fn weight_for(&self, kind: IndicatorKind) -> f64 {
        match kind {
            IndicatorKind::Keyword => self.keyword,
            IndicatorKind::IpReputation => self.ip_reputation,
            IndicatorKind::Pattern => self.pattern,
            IndicatorKind::BehavioralAnomaly => self.behavioral_anomaly,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (IndicatorKind, f64)> + '_ {
        [
            IndicatorKind::Keyword,
            IndicatorKind::IpReputation,
            IndicatorKind::Pattern,
            IndicatorKind::BehavioralAnomaly,
        ]
        .into_iter()
        .map(|kind| (kind, self.weight_for(kind)))
    }
}

/// Retry schedule for one dispatch lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Shorter, more persistent schedule for the urgent lane.
    pub fn urgent() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            backoff_multiplier: 2.0,
        }
    }

    fn validate(&self, lane: &str) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.max_attempts == 0 {
            warnings.push(format!(
                "dispatch.{lane}.max_attempts is 0; one attempt will be made"
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            warnings.push(format!(
                "dispatch.{lane}.backoff_multiplier is {}; backoff will not grow",
                self.backoff_multiplier
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            warnings.push(format!(
                "dispatch.{lane}.max_backoff_ms is below initial_backoff_ms"
            ));
        }
        warnings
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub normal: RetryPolicy,
    pub urgent: RetryPolicy,
    /// Upper bound on a single delivery attempt.
    pub attempt_timeout_ms: u64,
    /// Concurrent deliveries on the normal lane. The urgent lane is unbounded.
    pub max_concurrent: usize,
    /// Delivered outcomes remembered for idempotent re-dispatch.
    pub idempotency_cache_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            normal: RetryPolicy::default(),
            urgent: RetryPolicy::urgent(),
            attempt_timeout_ms: 5_000,
            max_concurrent: 16,
            idempotency_cache_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    /// Directory holding one JSON document per incident.
    pub dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        let dir = directories::ProjectDirs::from("dev", "vigil", "vigil")
            .map(|d| d.data_dir().join("incidents"))
            .unwrap_or_else(|| PathBuf::from(".vigil/incidents"));
        Self {
            enabled: false,
            dir,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub level: String,
    /// When set, JSON logs are also written to a daily file in this directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_dir: None,
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `VIGIL_`, `__` separates sections),
///    including any loaded from a `.env` file
/// 2. The explicit config file, if given
/// 3. User config (`<config dir>/vigil/config.toml`)
/// 4. Built-in defaults
pub fn load_config(file: Option<&Path>) -> Result<EngineConfig, Box<figment::Error>> {
    let _ = dotenvy::dotenv();

    let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "vigil", "vigil") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(path) = file {
        figment = figment.merge(Toml::file(path));
    }

    // VIGIL_WORKERS, VIGIL_CORRELATION__WINDOW_SECS, VIGIL_DISPATCH__NORMAL__MAX_ATTEMPTS, ...
    figment = figment.merge(Env::prefixed("VIGIL_").split("__"));

    figment.extract().map_err(Box::new)
}
