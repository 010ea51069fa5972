use crate::{
    error::{Result, ZanzibarError},
    evaluator::EvaluationLimits,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "ZANZIBAR";

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum evaluation depth before a check fails
    pub max_depth: u32,

    /// Deadline for one request, in milliseconds
    pub request_timeout_ms: u64,

    /// How long an issued consistency token stays usable
    pub token_retention_secs: u64,

    /// Concurrent checks per batch
    pub batch_max_in_flight: usize,

    /// Concurrent tuple store reads per request
    pub max_concurrent_reads: usize,

    pub cache: CacheConfig,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis,
}

/// Result cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub backend: CacheBackend,
    /// Required for the redis backend
    pub redis_url: Option<String>,
    /// Entry cap of the memory backend
    pub max_entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

fn default_batch_max_in_flight() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        .saturating_mul(4)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 25,
            request_timeout_ms: 5000,
            token_retention_secs: 300,
            batch_max_in_flight: default_batch_max_in_flight(),
            max_concurrent_reads: 32,
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 60,
            backend: CacheBackend::Memory,
            redis_url: None,
            max_entries: 100_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Loads defaults, then `path` (YAML, TOML or JSON by extension), then
    /// `ZANZIBAR_*` environment variables. Nested keys use `__`, as in
    /// `ZANZIBAR_CACHE__TTL_SECS=30`.
    ///
    /// # Errors
    ///
    /// Unreadable or malformed sources, and values rejected by [`validate`](Self::validate).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .and_then(|built| built.try_deserialize())
            .map_err(|e| ZanzibarError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let zero = |field: &str| {
            Err(ZanzibarError::Configuration(format!(
                "{} must be greater than zero",
                field
            )))
        };

        if self.max_depth == 0 {
            return zero("max_depth");
        }
        if self.request_timeout_ms == 0 {
            return zero("request_timeout_ms");
        }
        if self.token_retention_secs == 0 {
            return zero("token_retention_secs");
        }
        if self.batch_max_in_flight == 0 {
            return zero("batch_max_in_flight");
        }
        if self.max_concurrent_reads == 0 {
            return zero("max_concurrent_reads");
        }
        if self.cache.enabled {
            if self.cache.ttl_secs == 0 {
                return zero("cache.ttl_secs");
            }
            if self.cache.backend == CacheBackend::Redis && self.cache.redis_url.is_none() {
                return Err(ZanzibarError::Configuration(
                    "cache.redis_url is required for the redis backend".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn limits(&self) -> EvaluationLimits {
        EvaluationLimits {
            max_depth: self.max_depth,
            timeout: Duration::from_millis(self.request_timeout_ms),
            max_concurrent_reads: self.max_concurrent_reads,
        }
    }

    pub fn token_retention(&self) -> Duration {
        Duration::from_secs(self.token_retention_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }
}
