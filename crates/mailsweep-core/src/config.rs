use serde::Deserialize;
use std::{env, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::owner::OwnerId;

const DEFAULT_CACHE_TTL_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub access: AccessConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub port: u16,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    pub database: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub export_traces: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ClassifierConfig {
    /// Lifetime of a cached rule set. Zero turns the cache off.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl ClassifierConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

/// Owner ids with privileges beyond their own records. Both lists are empty
/// unless configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AccessConfig {
    /// May run a classification sweep across every owner.
    #[serde(default)]
    pub admin_owner_ids: Vec<OwnerId>,
    /// Ids records were stored under before per-user ownership. Only these can
    /// be claimed.
    #[serde(default)]
    pub legacy_owner_ids: Vec<OwnerId>,
}

impl AccessConfig {
    pub fn is_admin(&self, owner: &OwnerId) -> bool {
        self.admin_owner_ids.contains(owner)
    }

    pub fn is_legacy(&self, owner: &OwnerId) -> bool {
        self.legacy_owner_ids.contains(owner)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid APP_PORT override: {0}")]
    InvalidPort(std::num::ParseIntError),
    #[error("invalid RULE_CACHE_TTL_SECS override: {0}")]
    InvalidCacheTtl(std::num::ParseIntError),
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides, and
    /// resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides()?;
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = env::var("APP_PORT") {
            self.app.port = port.parse().map_err(ConfigError::InvalidPort)?;
        }

        if let Ok(otlp) = env::var("OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(otlp);
        }

        if let Ok(database) = env::var("DATABASE_PATH") {
            self.paths.database = PathBuf::from(database);
        }

        if let Ok(ttl) = env::var("RULE_CACHE_TTL_SECS") {
            self.classifier.cache_ttl_secs = ttl.parse().map_err(ConfigError::InvalidCacheTtl)?;
        }

        Ok(())
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker_path(&mut self.paths.database)?;
        if let Some(endpoint) = &mut self.telemetry.otlp_endpoint {
            apply_env_marker(endpoint)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        let database = self.paths.database.to_string_lossy().to_string();
        self.paths.database = PathBuf::from(shellexpand::tilde(&database).as_ref());
    }
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        *value = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}
