//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level daemon configuration.
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    /// Path of the local database file.
    pub db_path: PathBuf,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            scheduler: SchedulerConfig::default(),
            db_path: PathBuf::from("./data/agent-console.db"),
        }
    }
}

/// External engine invocation settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine binary name or path.
    pub binary: String,
    /// Root of the engine's per-project transcript directories.
    pub projects_root: PathBuf,
}

/// Queue scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Polling interval between cycles.
    pub poll_interval: Duration,
    /// Maximum due items selected per cycle.
    pub batch_size: usize,
    /// Retry ceiling; an item reaching this count is marked failed.
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            binary: "claude".to_string(),
            projects_root: PathBuf::from(home).join(".claude/projects"),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 10,
            max_retries: 3,
        }
    }
}

impl ConsoleConfig {
    /// Build a config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self {
            db_path: PathBuf::from(
                std::env::var("AGENT_CONSOLE_DB_PATH")
                    .unwrap_or_else(|_| "./data/agent-console.db".to_string()),
            ),
            ..Self::default()
        };

        if let Ok(binary) = std::env::var("AGENT_CONSOLE_ENGINE_BIN") {
            config.engine.binary = binary;
        }
        if let Ok(root) = std::env::var("AGENT_CONSOLE_PROJECTS_ROOT") {
            config.engine.projects_root = PathBuf::from(root);
        }
        if let Some(secs) = env_parse::<u64>("AGENT_CONSOLE_POLL_SECS") {
            config.scheduler.poll_interval = Duration::from_secs(secs);
        }
        if let Some(batch) = env_parse::<usize>("AGENT_CONSOLE_BATCH_SIZE") {
            config.scheduler.batch_size = batch;
        }
        if let Some(retries) = env_parse::<u32>("AGENT_CONSOLE_MAX_RETRIES") {
            config.scheduler.max_retries = retries;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_retries, 3);
    }
}
