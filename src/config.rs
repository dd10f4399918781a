//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Per-worker configuration.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Thread name. Defaults to `worker-<short id>`.
    pub name: Option<String>,
    /// Thread stack size in bytes. Defaults to the platform default.
    pub stack_size: Option<usize>,
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers to start.
    pub size: usize,
    /// Workers are named `<prefix>-<index>`.
    pub name_prefix: String,
    /// Thread stack size for every worker.
    pub stack_size: Option<usize>,
    /// Budget for one multi-wait in a polling loop.
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            name_prefix: "worker".to_string(),
            stack_size: None,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl PoolConfig {
    /// Defaults overridden by `ISOWORKER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(size) = parse(&lookup, "ISOWORKER_POOL_SIZE")? {
            if size == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "ISOWORKER_POOL_SIZE".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            config.size = size;
        }
        if let Some(prefix) = lookup("ISOWORKER_NAME_PREFIX") {
            config.name_prefix = prefix;
        }
        if let Some(stack_size) = parse(&lookup, "ISOWORKER_STACK_SIZE")? {
            config.stack_size = Some(stack_size);
        }
        if let Some(ms) = parse::<u64>(&lookup, "ISOWORKER_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Configuration for the worker at `index`.
    pub fn worker_config(&self, index: usize) -> WorkerConfig {
        WorkerConfig {
            name: Some(format!("{}-{}", self.name_prefix, index)),
            stack_size: self.stack_size,
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = PoolConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.size >= 1);
        assert_eq!(config.name_prefix, "worker");
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn env_overrides() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("ISOWORKER_POOL_SIZE", "10"),
            ("ISOWORKER_NAME_PREFIX", "iso"),
            ("ISOWORKER_STACK_SIZE", "1048576"),
            ("ISOWORKER_POLL_INTERVAL_MS", " 25 "),
        ]))
        .unwrap();
        assert_eq!(config.size, 10);
        assert_eq!(config.name_prefix, "iso");
        assert_eq!(config.stack_size, Some(1_048_576));
        assert_eq!(config.poll_interval, Duration::from_millis(25));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = PoolConfig::from_lookup(lookup(&[("ISOWORKER_POOL_SIZE", "ten")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ISOWORKER_POOL_SIZE"));

        let err = PoolConfig::from_lookup(lookup(&[("ISOWORKER_POOL_SIZE", "0")])).unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn worker_config_names_by_index() {
        let config = PoolConfig {
            name_prefix: "iso".to_string(),
            stack_size: Some(64 * 1024),
            ..Default::default()
        };
        let worker = config.worker_config(3);
        assert_eq!(worker.name.as_deref(), Some("iso-3"));
        assert_eq!(worker.stack_size, Some(64 * 1024));
    }
}
