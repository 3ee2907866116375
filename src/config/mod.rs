//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{CacheConfig, StrategyKind};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "regioncache";
const ENV_PREFIX: &str = "REGIONCACHE";
const DEFAULT_SOAK_THREADS: usize = 8;
const DEFAULT_SOAK_KEYS: usize = 16;
const DEFAULT_SOAK_ROUNDS: usize = 4;
const DEFAULT_SOAK_WORK_MS: u64 = 5;
const DEFAULT_SOAK_REGION: &str = "Page";

/// Command-line arguments for the regioncache binary.
#[derive(Debug, Parser)]
#[command(name = "regioncache", version, about = "Stampede-safe region cache driver")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "REGIONCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Hammer the cache from many threads and report how often factories ran.
    Soak(SoakArgs),
    /// Cache a few entries against an identifier, then invalidate it through the event queue.
    Invalidate(InvalidateArgs),
}

#[derive(Debug, Args, Clone)]
pub struct SoakArgs {
    /// Worker threads per round.
    #[arg(long, default_value_t = DEFAULT_SOAK_THREADS)]
    pub threads: usize,

    /// Distinct keys each worker requests per round.
    #[arg(long, default_value_t = DEFAULT_SOAK_KEYS)]
    pub keys: usize,

    /// Rounds; every key is invalidated between rounds.
    #[arg(long, default_value_t = DEFAULT_SOAK_ROUNDS)]
    pub rounds: usize,

    /// Simulated factory cost in milliseconds.
    #[arg(long = "work-ms", default_value_t = DEFAULT_SOAK_WORK_MS)]
    pub work_ms: u64,

    /// Region the soak keys live in.
    #[arg(long, default_value = DEFAULT_SOAK_REGION)]
    pub region: String,
}

impl Default for SoakArgs {
    fn default() -> Self {
        Self {
            threads: DEFAULT_SOAK_THREADS,
            keys: DEFAULT_SOAK_KEYS,
            rounds: DEFAULT_SOAK_ROUNDS,
            work_ms: DEFAULT_SOAK_WORK_MS,
            region: DEFAULT_SOAK_REGION.to_string(),
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct InvalidateArgs {
    /// Dependency identifier to invalidate.
    #[arg(long, value_name = "IDENTIFIER")]
    pub identifier: String,

    /// Entries to cache against the identifier first.
    #[arg(long, default_value_t = 3)]
    pub entries: usize,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the stampede strategy (lock_table|lock_free).
    #[arg(long = "cache-strategy", value_name = "STRATEGY", global = true)]
    pub strategy: Option<String>,

    /// Override the lock-table wait timeout.
    #[arg(long = "cache-lock-timeout-ms", value_name = "MS", global = true)]
    pub lock_timeout_ms: Option<u64>,

    /// Override the lock-free spin budget.
    #[arg(long = "cache-spin-timeout-ms", value_name = "MS", global = true)]
    pub spin_timeout_ms: Option<u64>,

    /// Override the lock-free slot table size.
    #[arg(long = "cache-slot-table-size", value_name = "COUNT", global = true)]
    pub slot_table_size: Option<usize>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides)?;

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: CacheConfig,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) -> Result<(), LoadError> {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(strategy) = overrides.strategy.as_ref() {
            self.cache.strategy = StrategyKind::from_str(strategy)
                .map_err(|reason| LoadError::invalid("cache.strategy", reason))?;
        }
        if let Some(timeout) = overrides.lock_timeout_ms {
            self.cache.lock_timeout_ms = timeout;
        }
        if let Some(timeout) = overrides.spin_timeout_ms {
            self.cache.spin_timeout_ms = timeout;
        }
        if let Some(size) = overrides.slot_table_size {
            self.cache.slot_table_size = size;
        }
        Ok(())
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        Ok(Self {
            logging: build_logging_settings(raw.logging)?,
            cache: build_cache_settings(raw.cache)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: CacheConfig) -> Result<CacheConfig, LoadError> {
    if cache.lock_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.lock_timeout_ms",
            "must be greater than zero",
        ));
    }
    if cache.spin_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.spin_timeout_ms",
            "must be greater than zero",
        ));
    }
    if cache.slot_table_size == 0 {
        return Err(LoadError::invalid(
            "cache.slot_table_size",
            "must be greater than zero",
        ));
    }
    if cache.auto_consume_interval_ms == 0 {
        return Err(LoadError::invalid(
            "cache.auto_consume_interval_ms",
            "must be greater than zero",
        ));
    }
    Ok(cache)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
