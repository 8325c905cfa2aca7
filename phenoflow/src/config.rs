//! Engine configuration.
//!
//! Loaded from TOML, then overridden by `PHENOFLOW__<SECTION>__<KEY>`
//! environment variables. Every field has a default so an empty file (or no
//! file) is a valid configuration.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "PHENOFLOW__";

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Production.
    #[default]
    Prod,
    /// Pre-production.
    Beta,
    /// Automated tests; pipeline names get a `_TEST` suffix.
    Test,
}

impl Environment {
    /// Applies the environment's naming rule to a pipeline name.
    #[must_use]
    pub fn qualify_pipeline_name(self, name: &str) -> String {
        match self {
            Self::Test if !name.ends_with("_TEST") => format!("{name}_TEST"),
            _ => name.to_string(),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prod => write!(f, "prod"),
            Self::Beta => write!(f, "beta"),
            Self::Test => write!(f, "test"),
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Ok(Self::Prod),
            "beta" => Ok(Self::Beta),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidValue {
                key: "environment".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EngineConfig {
    /// Deployment environment.
    #[serde(default)]
    pub environment: Environment,
    /// Pipeline compilation and dispatch settings.
    #[serde(default)]
    pub pipelines: PipelinesConfig,
    /// Output cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Health check settings.
    #[serde(default)]
    pub health: HealthConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Pipeline compilation and dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelinesConfig {
    /// Directory compiled artifacts are written to.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    /// How many times dispatch polls the scheduler for registration.
    #[serde(default = "default_registration_attempts")]
    pub registration_attempts: u32,
    /// Delay between registration polls.
    #[serde(default = "default_registration_delay_ms")]
    pub registration_delay_ms: u64,
    /// `max_active_runs` of new definitions.
    #[serde(default = "default_max_active_runs")]
    pub default_max_active_runs: u32,
    /// `concurrency` of new definitions.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: u32,
}

impl Default for PipelinesConfig {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
            registration_attempts: default_registration_attempts(),
            registration_delay_ms: default_registration_delay_ms(),
            default_max_active_runs: default_max_active_runs(),
            default_concurrency: default_concurrency(),
        }
    }
}

impl PipelinesConfig {
    /// Registration poll delay as a `Duration`.
    #[must_use]
    pub fn registration_delay(&self) -> Duration {
        Duration::from_millis(self.registration_delay_ms)
    }
}

/// Output cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// TTL of task outputs; `0` keeps them forever.
    #[serde(default = "default_task_output_ttl_secs")]
    pub task_output_ttl_secs: u64,
    /// Prefix of generation marker keys.
    #[serde(default = "default_generation_lock_prefix")]
    pub generation_lock_prefix: String,
    /// TTL of generation markers.
    #[serde(default = "default_generation_lock_ttl_secs")]
    pub generation_lock_ttl_secs: u64,
    /// Extra `<prefix><task_run_id>` keys deleted when a task reruns.
    #[serde(default)]
    pub rerun_purge_prefixes: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            task_output_ttl_secs: default_task_output_ttl_secs(),
            generation_lock_prefix: default_generation_lock_prefix(),
            generation_lock_ttl_secs: default_generation_lock_ttl_secs(),
            rerun_purge_prefixes: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Task output TTL, `None` meaning no expiry.
    #[must_use]
    pub fn task_output_ttl(&self) -> Option<Duration> {
        (self.task_output_ttl_secs > 0).then(|| Duration::from_secs(self.task_output_ttl_secs))
    }

    /// Generation marker TTL.
    #[must_use]
    pub fn generation_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.generation_lock_ttl_secs)
    }
}

/// Health check settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    /// Age after which a `STARTED` record counts as stale.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl HealthConfig {
    /// Stale threshold as a chrono duration.
    #[must_use]
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.stale_after_secs).unwrap_or(i64::MAX))
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("./pipelines")
}

fn default_registration_attempts() -> u32 {
    10
}

fn default_registration_delay_ms() -> u64 {
    1000
}

fn default_max_active_runs() -> u32 {
    10
}

fn default_concurrency() -> u32 {
    1
}

fn default_task_output_ttl_secs() -> u64 {
    0
}

fn default_generation_lock_prefix() -> String {
    crate::cache::DEFAULT_LOCK_PREFIX.to_string()
}

fn default_generation_lock_ttl_secs() -> u64 {
    3600
}

fn default_stale_after_secs() -> u64 {
    4 * 3600
}

fn default_log_filter() -> String {
    "phenoflow=info".to_string()
}

impl EngineConfig {
    /// Configuration for tests: `test` environment, no registration delay.
    #[must_use]
    pub fn for_tests() -> Self {
        let mut cfg = Self {
            environment: Environment::Test,
            ..Self::default()
        };
        cfg.pipelines.registration_delay_ms = 0;
        cfg.pipelines.registration_attempts = 3;
        cfg
    }

    /// Parses a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reads a TOML file, then applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut cfg = Self::from_toml_str(&s)?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Applies `PHENOFLOW__<SECTION>__<KEY>` variables from the process
    /// environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(std::env::vars())
    }

    /// Applies overrides from `(name, value)` pairs. Names without the
    /// `PHENOFLOW__` prefix are ignored; unknown keys and unparsable values
    /// are errors.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            if value.trim().is_empty() {
                continue;
            }
            let key = rest.to_ascii_lowercase().replace("__", ".");
            self.set_value(&key, value.trim())?;
        }
        Ok(())
    }

    fn set_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "environment" => self.environment = value.parse()?,
            "pipelines.artifact_dir" => self.pipelines.artifact_dir = PathBuf::from(value),
            "pipelines.registration_attempts" => {
                self.pipelines.registration_attempts = parse(key, value)?;
            }
            "pipelines.registration_delay_ms" => {
                self.pipelines.registration_delay_ms = parse(key, value)?;
            }
            "pipelines.default_max_active_runs" => {
                self.pipelines.default_max_active_runs = parse(key, value)?;
            }
            "pipelines.default_concurrency" => {
                self.pipelines.default_concurrency = parse(key, value)?;
            }
            "cache.task_output_ttl_secs" => self.cache.task_output_ttl_secs = parse(key, value)?,
            "cache.generation_lock_prefix" => {
                self.cache.generation_lock_prefix = value.to_string();
            }
            "cache.generation_lock_ttl_secs" => {
                self.cache.generation_lock_ttl_secs = parse(key, value)?;
            }
            "cache.rerun_purge_prefixes" => {
                self.cache.rerun_purge_prefixes = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect();
            }
            "health.stale_after_secs" => self.health.stale_after_secs = parse(key, value)?,
            "logging.filter" => self.logging.filter = value.to_string(),
            "logging.json" => self.logging.json = parse(key, value)?,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
