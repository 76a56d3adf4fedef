use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::collections::HashSet;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidRotation(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid requests_per_second: {0}. Must be at least 1")]
    InvalidRateLimit(u32),

    #[error("Invalid burst_size: {0}. Must be at least 1")]
    InvalidBurstSize(u32),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Deployment pool cannot be empty")]
    EmptyDeploymentPool,

    #[error("Invalid deployment '{0}': {1}")]
    InvalidDeployment(String, String),

    #[error("Invalid max_attempts: {0}. Must be at least 1")]
    InvalidMaxAttempts(u32),

    #[error("Invalid heartbeat: timeout_secs ({timeout}) must exceed interval_secs ({interval})")]
    InvalidHeartbeat { interval: u64, timeout: u64 },

    #[error("Invalid completion provider: {0}. Must be one of: openai, scripted")]
    InvalidProvider(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .foreman/config.yaml (project config)
    /// 3. .foreman/local.yaml (project local overrides, optional)
    /// 4. Environment variables (FOREMAN_* prefix, `__` separates nested keys)
    pub fn load() -> Result<Config> {
        let config: Config = Self::figment()
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// The merged provider stack used by [`ConfigLoader::load`].
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".foreman/config.yaml"))
            .merge(Yaml::file(".foreman/local.yaml"))
            .merge(Env::prefixed("FOREMAN_").split("__"))
    }

    /// Load configuration from a specific file, still honoring environment overrides
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("FOREMAN_").split("__"))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(
                config.database.max_connections,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidRotation(config.logging.rotation.clone()));
        }

        if config.rate_limit.enabled {
            if config.rate_limit.requests_per_second == 0 {
                return Err(ConfigError::InvalidRateLimit(
                    config.rate_limit.requests_per_second,
                ));
            }
            if config.rate_limit.burst_size == 0 {
                return Err(ConfigError::InvalidBurstSize(config.rate_limit.burst_size));
            }
        }

        if config.retry.initial_backoff_ms >= config.retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.retry.initial_backoff_ms,
                config.retry.max_backoff_ms,
            ));
        }

        let dispatcher = &config.dispatcher;
        if dispatcher.deployments.is_empty() {
            return Err(ConfigError::EmptyDeploymentPool);
        }
        let mut seen = HashSet::new();
        for deployment in &dispatcher.deployments {
            if deployment.name.trim().is_empty() {
                return Err(ConfigError::InvalidDeployment(
                    deployment.name.clone(),
                    "name cannot be empty".to_string(),
                ));
            }
            if !seen.insert(deployment.name.as_str()) {
                return Err(ConfigError::InvalidDeployment(
                    deployment.name.clone(),
                    "duplicate name".to_string(),
                ));
            }
            if deployment.context_window <= config.governor.safety_buffer {
                return Err(ConfigError::InvalidDeployment(
                    deployment.name.clone(),
                    format!(
                        "context_window {} must exceed safety_buffer {}",
                        deployment.context_window, config.governor.safety_buffer
                    ),
                ));
            }
        }
        if dispatcher.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(dispatcher.max_attempts));
        }

        if config.governor.max_prompt_tokens == 0 || config.governor.hard_output_cap == 0 {
            return Err(ConfigError::ValidationFailed(
                "governor max_prompt_tokens and hard_output_cap must be positive".to_string(),
            ));
        }

        let heartbeat = &config.heartbeat;
        if heartbeat.interval_secs == 0 || heartbeat.timeout_secs <= heartbeat.interval_secs {
            return Err(ConfigError::InvalidHeartbeat {
                interval: heartbeat.interval_secs,
                timeout: heartbeat.timeout_secs,
            });
        }

        if config.checkpoint.dir.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "checkpoint dir cannot be empty".to_string(),
            ));
        }

        let valid_providers = ["openai", "scripted"];
        if !valid_providers.contains(&config.completion.provider.as_str()) {
            return Err(ConfigError::InvalidProvider(
                config.completion.provider.clone(),
            ));
        }

        if config.github.enabled && (config.github.owner.is_empty() || config.github.repo.is_empty())
        {
            return Err(ConfigError::ValidationFailed(
                "github owner and repo are required when github is enabled".to_string(),
            ));
        }

        Ok(())
    }
}
