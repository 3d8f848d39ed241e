//! Configuration loading and representation.
//!
//! Everything is read from environment variables. Parsing goes through a
//! lookup function so tests never touch the process environment.

use std::time::Duration;

/// Default worker slots per queue listed without an explicit `:n`.
pub const DEFAULT_QUEUE_CONCURRENCY: usize = 2;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Which broker the process talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerKind {
    #[default]
    Memory,
    Redis,
    /// No broker: every queue operation degrades.
    None,
}

/// A queue this process runs workers for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskforgeConfig {
    pub broker: BrokerKind,
    pub redis_url: Option<String>,
    /// Set only when persistent stores are enabled.
    pub database_url: Option<String>,
    pub queues: Vec<QueueSpec>,
    pub poll_interval: Duration,
    pub job_timeout: Option<Duration>,
    pub stalled_after: Duration,
    pub cron_tick: Duration,
    pub keep_completed: usize,
    pub bind_addr: String,
}

impl Default for TaskforgeConfig {
    fn default() -> Self {
        Self {
            broker: BrokerKind::Memory,
            redis_url: None,
            database_url: None,
            queues: Vec::new(),
            poll_interval: Duration::from_millis(250),
            job_timeout: None,
            stalled_after: Duration::from_millis(30_000),
            cron_tick: Duration::from_millis(1_000),
            keep_completed: 1_000,
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_u64(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|e| invalid(var, value, e.to_string()))
}

fn parse_positive_ms(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match parse_u64(var, value)? {
        0 => Err(invalid(var, value, "must be positive")),
        ms => Ok(Duration::from_millis(ms)),
    }
}

fn parse_queues(value: &str) -> Result<Vec<QueueSpec>, ConfigError> {
    const VAR: &str = "TASKFORGE_QUEUES";
    let mut queues: Vec<QueueSpec> = Vec::new();
    for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, concurrency) = match item.split_once(':') {
            Some((name, n)) => {
                let n = n
                    .trim()
                    .parse::<usize>()
                    .map_err(|e| invalid(VAR, value, format!("queue '{name}': {e}")))?;
                (name.trim(), n)
            }
            None => (item, DEFAULT_QUEUE_CONCURRENCY),
        };
        if name.is_empty() {
            return Err(invalid(VAR, value, "empty queue name"));
        }
        if concurrency == 0 {
            return Err(invalid(VAR, value, format!("queue '{name}': concurrency must be at least 1")));
        }
        if queues.iter().any(|q| q.name == name) {
            return Err(invalid(VAR, value, format!("queue '{name}' listed twice")));
        }
        queues.push(QueueSpec {
            name: name.to_string(),
            concurrency,
        });
    }
    Ok(queues)
}

impl TaskforgeConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.redis_url = lookup("REDIS_URL").filter(|s| !s.trim().is_empty());

        if let Some(value) = lookup("TASKFORGE_BROKER") {
            config.broker = match value.trim().to_ascii_lowercase().as_str() {
                "memory" | "in-memory" => BrokerKind::Memory,
                "redis" => BrokerKind::Redis,
                "none" | "off" => BrokerKind::None,
                _ => return Err(invalid("TASKFORGE_BROKER", &value, "expected memory, redis or none")),
            };
        }
        if config.broker == BrokerKind::Redis && config.redis_url.is_none() {
            return Err(ConfigError::Missing("REDIS_URL"));
        }

        let use_persistent = lookup("USE_PERSISTENT_STORES")
            .map(|v| v.trim().parse::<bool>().unwrap_or(false))
            .unwrap_or(false);
        if use_persistent {
            config.database_url = Some(lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?);
        }

        if let Some(value) = lookup("TASKFORGE_QUEUES") {
            config.queues = parse_queues(&value)?;
        }
        if let Some(value) = lookup("TASKFORGE_POLL_INTERVAL_MS") {
            config.poll_interval = parse_positive_ms("TASKFORGE_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup("TASKFORGE_JOB_TIMEOUT_MS") {
            config.job_timeout = Some(parse_positive_ms("TASKFORGE_JOB_TIMEOUT_MS", &value)?);
        }
        if let Some(value) = lookup("TASKFORGE_STALLED_AFTER_MS") {
            config.stalled_after = parse_positive_ms("TASKFORGE_STALLED_AFTER_MS", &value)?;
        }
        if let Some(value) = lookup("TASKFORGE_CRON_TICK_MS") {
            config.cron_tick = parse_positive_ms("TASKFORGE_CRON_TICK_MS", &value)?;
        }
        if let Some(value) = lookup("TASKFORGE_KEEP_COMPLETED") {
            config.keep_completed = usize::try_from(parse_u64("TASKFORGE_KEEP_COMPLETED", &value)?)
                .map_err(|e| invalid("TASKFORGE_KEEP_COMPLETED", &value, e.to_string()))?;
        }
        if let Some(value) = lookup("TASKFORGE_BIND_ADDR") {
            config.bind_addr = value;
        }

        if let Some(timeout) = config.job_timeout {
            if timeout >= config.stalled_after {
                return Err(invalid(
                    "TASKFORGE_JOB_TIMEOUT_MS",
                    &timeout.as_millis().to_string(),
                    "must be shorter than TASKFORGE_STALLED_AFTER_MS",
                ));
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<TaskforgeConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        TaskforgeConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(load(&[]).unwrap(), TaskforgeConfig::default());
    }

    #[test]
    fn queues_parse_with_default_concurrency() {
        let config = load(&[("TASKFORGE_QUEUES", "emails, reports:5 ,")]).unwrap();
        assert_eq!(
            config.queues,
            vec![
                QueueSpec { name: "emails".into(), concurrency: 2 },
                QueueSpec { name: "reports".into(), concurrency: 5 },
            ]
        );
    }

    #[test]
    fn bad_queue_entries_are_rejected() {
        assert!(load(&[("TASKFORGE_QUEUES", "a:0")]).is_err());
        assert!(load(&[("TASKFORGE_QUEUES", "a,a")]).is_err());
        assert!(load(&[("TASKFORGE_QUEUES", ":3")]).is_err());
        assert!(load(&[("TASKFORGE_QUEUES", "a:x")]).is_err());
    }

    #[test]
    fn redis_broker_requires_url() {
        assert_eq!(
            load(&[("TASKFORGE_BROKER", "redis")]),
            Err(ConfigError::Missing("REDIS_URL"))
        );
        let config = load(&[("TASKFORGE_BROKER", "redis"), ("REDIS_URL", "redis://localhost")]).unwrap();
        assert_eq!(config.broker, BrokerKind::Redis);
    }

    #[test]
    fn persistent_stores_require_database_url() {
        assert_eq!(
            load(&[("USE_PERSISTENT_STORES", "true")]),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
        let config = load(&[("USE_PERSISTENT_STORES", "false"), ("DATABASE_URL", "postgres://x")]).unwrap();
        assert!(config.database_url.is_none());
    }

    #[test]
    fn numbers_must_parse_and_be_positive() {
        assert!(matches!(
            load(&[("TASKFORGE_POLL_INTERVAL_MS", "fast")]),
            Err(ConfigError::Invalid { var: "TASKFORGE_POLL_INTERVAL_MS", .. })
        ));
        assert!(load(&[("TASKFORGE_CRON_TICK_MS", "0")]).is_err());
        let config = load(&[("TASKFORGE_POLL_INTERVAL_MS", "50"), ("TASKFORGE_KEEP_COMPLETED", "0")]).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.keep_completed, 0);
    }

    #[test]
    fn timeout_must_undercut_stall_detection() {
        assert!(load(&[("TASKFORGE_JOB_TIMEOUT_MS", "30000")]).is_err());
        let config = load(&[("TASKFORGE_JOB_TIMEOUT_MS", "5000")]).unwrap();
        assert_eq!(config.job_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn unknown_broker_kind_is_rejected() {
        assert!(load(&[("TASKFORGE_BROKER", "kafka")]).is_err());
        assert_eq!(load(&[("TASKFORGE_BROKER", "none")]).unwrap().broker, BrokerKind::None);
    }
}
