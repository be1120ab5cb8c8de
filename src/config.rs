//! Node configuration.
//!
//! Loaded from a JSON file by the binary; tests build it in code. Missing
//! fields fall back to the defaults below.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PARTITION_COUNT: u32 = 271;
pub const DEFAULT_POOL_SIZE: usize = 16;
pub const DEFAULT_CAPACITY: usize = 100;

/// Settings for one durable executor name, applied per partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DurableExecutorConfig {
    /// Tasks running at once in one partition.
    pub pool_size: usize,
    /// Bounds both the result ring and the pending queue of one partition.
    pub capacity: usize,
}

impl Default for DurableExecutorConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl DurableExecutorConfig {
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Retry policy for operations sent to partition owners.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InvocationConfig {
    pub max_attempts: usize,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Per-call timeout for operations that do not wait on a task.
    pub call_timeout_ms: u64,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 40,
            backoff_base_ms: 150,
            backoff_cap_ms: 1200,
            call_timeout_ms: 10_000,
        }
    }
}

impl InvocationConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeConfig {
    pub partition_count: u32,
    pub backup_count: usize,
    pub invocation: InvocationConfig,
    /// Used for executor names without their own entry.
    pub default_executor: DurableExecutorConfig,
    pub executors: HashMap<String, DurableExecutorConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            partition_count: DEFAULT_PARTITION_COUNT,
            backup_count: 1,
            invocation: InvocationConfig::default(),
            default_executor: DurableExecutorConfig::default(),
            executors: HashMap::new(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_executor(mut self, name: &str, executor: DurableExecutorConfig) -> Self {
        self.executors.insert(name.to_string(), executor);
        self
    }

    pub fn executor_config(&self, name: &str) -> &DurableExecutorConfig {
        self.executors.get(name).unwrap_or(&self.default_executor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            bail!("partition_count must be greater than zero");
        }
        if self.invocation.max_attempts == 0 {
            bail!("invocation.max_attempts must be greater than zero");
        }

        let named = self.executors.iter().map(|(name, c)| (name.as_str(), c));
        for (name, executor) in std::iter::once(("<default>", &self.default_executor)).chain(named) {
            if executor.pool_size == 0 {
                bail!("executor '{}': pool_size must be greater than zero", name);
            }
            if executor.capacity == 0 {
                bail!("executor '{}': capacity must be greater than zero", name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.partition_count, 271);
        assert_eq!(config.backup_count, 1);
        assert_eq!(config.executor_config("anything").pool_size, 16);
        assert_eq!(config.executor_config("anything").capacity, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_named_executor_overrides_default() {
        let config = NodeConfig::default().with_executor(
            "small",
            DurableExecutorConfig::default().with_pool_size(1).with_capacity(1),
        );

        assert_eq!(config.executor_config("small").pool_size, 1);
        assert_eq!(config.executor_config("small").capacity, 1);
        assert_eq!(config.executor_config("other").capacity, 100);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: NodeConfig = serde_json::from_str(
            r#"{ "partition_count": 16, "executors": { "jobs": { "capacity": 5 } } }"#,
        )
        .unwrap();

        assert_eq!(config.partition_count, 16);
        assert_eq!(config.backup_count, 1);
        assert_eq!(config.executor_config("jobs").capacity, 5);
        assert_eq!(config.executor_config("jobs").pool_size, 16);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = NodeConfig::default();
        config.partition_count = 0;
        assert!(config.validate().is_err());

        let config = NodeConfig::default()
            .with_executor("bad", DurableExecutorConfig::default().with_pool_size(0));
        let error = config.validate().unwrap_err().to_string();
        assert!(error.contains("bad"));
    }

    #[test]
    fn test_from_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("durable-config-{}.json", uuid::Uuid::new_v4()));
        let config = NodeConfig::default().with_executor("jobs", DurableExecutorConfig::default());
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = NodeConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_from_file_missing_path() {
        let error = NodeConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(format!("{:#}", error).contains("Failed to read config file"));
    }
}
