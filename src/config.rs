//! Engine configuration.
//!
//! [`EngineConfig`] is plain serde data with defaults for every field, so a
//! partial YAML/JSON/TOML document is enough. A few limits can be overridden
//! from the environment for deployments that cannot ship a config file.

use serde::{Deserialize, Serialize};

use crate::dsl::parse_value;
use crate::error::WorkflowError;
use crate::scheduler::DeploymentEdition;

pub use crate::dsl::DslFormat as ConfigFormat;

pub const ENV_MAX_STEPS: &str = "XWORKFLOW_MAX_STEPS";
pub const ENV_MAX_EXECUTION_TIME: &str = "XWORKFLOW_MAX_EXECUTION_TIME";
pub const ENV_MAX_CONCURRENCY: &str = "XWORKFLOW_MAX_CONCURRENCY";
pub const ENV_EDITION: &str = "XWORKFLOW_EDITION";

/// Configuration for the workflow engine
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub max_steps: i32,
    pub max_execution_time_secs: u64,
    /// Maximum nodes running at once; 0 means unbounded.
    pub max_concurrency: usize,
    pub queue_capacity: usize,
    pub ping_interval_secs: u64,
    pub listen_timeout_secs: u64,
    pub default_node_timeout_secs: Option<u64>,
    /// Upper bound for loop nodes, applied on top of their own `loop_count`.
    pub max_loop_iterations: usize,
    pub fairness: FairnessConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_steps: 500,
            max_execution_time_secs: 600,
            max_concurrency: 0,
            queue_capacity: 1024,
            ping_interval_secs: 10,
            listen_timeout_secs: 1200,
            default_node_timeout_secs: None,
            max_loop_iterations: 100,
            fairness: FairnessConfig::default(),
        }
    }
}

/// Admission control settings for the CFS-style run scheduler.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct FairnessConfig {
    pub edition: DeploymentEdition,
    /// Time slice a sandbox run may hold while other sandbox work waits.
    pub granularity_secs: u64,
    pub sandbox_concurrency: usize,
    /// Aging: a ticket waiting this long is admitted regardless.
    pub max_wait_secs: u64,
    /// Aging: a ticket deferred this many times is admitted regardless.
    pub max_deferrals: u32,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        FairnessConfig {
            edition: DeploymentEdition::SelfHosted,
            granularity_secs: 30,
            sandbox_concurrency: 2,
            max_wait_secs: 300,
            max_deferrals: 20,
        }
    }
}

impl EngineConfig {
    /// Parse a config document, then apply environment overrides.
    pub fn from_str(content: &str, format: ConfigFormat) -> Result<Self, WorkflowError> {
        let config: EngineConfig = if content.trim().is_empty() {
            EngineConfig::default()
        } else {
            parse_value(content, format)
                .map_err(|e| WorkflowError::ConfigError(e.to_string()))?
        };
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, WorkflowError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_MAX_STEPS) {
            self.max_steps = parse_override(ENV_MAX_STEPS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_EXECUTION_TIME) {
            self.max_execution_time_secs = parse_override(ENV_MAX_EXECUTION_TIME, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_CONCURRENCY) {
            self.max_concurrency = parse_override(ENV_MAX_CONCURRENCY, &v)?;
        }
        if let Some(v) = lookup(ENV_EDITION) {
            self.fairness.edition = match v.trim().to_ascii_lowercase().as_str() {
                "cloud" => DeploymentEdition::Cloud,
                "self_hosted" | "self-hosted" | "selfhosted" => DeploymentEdition::SelfHosted,
                other => {
                    return Err(WorkflowError::ConfigError(format!(
                        "{}: unknown edition '{}'",
                        ENV_EDITION, other
                    )))
                }
            };
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        if self.max_steps <= 0 {
            return Err(WorkflowError::ConfigError(
                "max_steps must be positive".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(WorkflowError::ConfigError(
                "queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, WorkflowError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| WorkflowError::ConfigError(format!("{}: invalid value '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.max_steps, 500);
        assert_eq!(config.max_execution_time_secs, 600);
        assert_eq!(config.max_concurrency, 0);
        assert_eq!(config.fairness.edition, DeploymentEdition::SelfHosted);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "max_steps: 20\nfairness:\n  edition: cloud\n  sandbox_concurrency: 1\n";
        let config: EngineConfig = parse_value(yaml, ConfigFormat::Yaml).unwrap();
        let config = config.with_env_overrides(no_env).unwrap();
        assert_eq!(config.max_steps, 20);
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.fairness.edition, DeploymentEdition::Cloud);
        assert_eq!(config.fairness.sandbox_concurrency, 1);
        assert_eq!(config.fairness.max_deferrals, 20);
    }

    #[test]
    fn test_toml_and_json() {
        let config: EngineConfig =
            parse_value("max_concurrency = 4\n", ConfigFormat::Toml).unwrap();
        assert_eq!(config.max_concurrency, 4);
        let config: EngineConfig =
            parse_value(r#"{"listen_timeout_secs": 5}"#, ConfigFormat::Json).unwrap();
        assert_eq!(config.listen_timeout_secs, 5);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_MAX_STEPS, "42"),
            (ENV_MAX_CONCURRENCY, "3"),
            (ENV_EDITION, "CLOUD"),
        ]);
        let config = EngineConfig::default()
            .with_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_steps, 42);
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.fairness.edition, DeploymentEdition::Cloud);
    }

    #[test]
    fn test_invalid_override_is_config_error() {
        let result = EngineConfig::default().with_env_overrides(|k| {
            (k == ENV_MAX_STEPS).then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(WorkflowError::ConfigError(_))));
    }

    #[test]
    fn test_rejects_zero_steps() {
        let config = EngineConfig {
            max_steps: 0,
            ..Default::default()
        };
        assert!(config.with_env_overrides(no_env).is_err());
    }
}
