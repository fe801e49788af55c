use std::path::PathBuf;
use std::time::Duration;

use ioforge_common::config::{ConfigLoader, DbSqliteConfig, RedisConfig, RetryConfig};
use ioforge_common::tracing::TracingConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub tracing: TracingConfig,
    /// Root of the persisted layout (catalog, execution directories, db).
    pub data_root: PathBuf,
    pub db: DbSqliteConfig,
    pub redis: RedisConfig,
    pub deploy: DeployConfig,
    pub engine: EngineConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            tracing: TracingConfig::local_dev("ioforge-manager"),
            data_root: PathBuf::from("data"),
            db: DbSqliteConfig::default(),
            redis: RedisConfig::default(),
            deploy: DeployConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// URL agents use to call back into the controller.
    pub controller_url: String,
    /// Broker URL handed to agents for pub/sub.
    pub broker_url: String,
    /// Agent installation root on workers.
    pub agent_root: String,
    /// Local directory holding the agent file tree to copy.
    pub agent_package_dir: PathBuf,
    /// Remote log file the agent writes to.
    pub agent_log_path: String,
    /// Optional command run during the stage step to provision a runtime.
    pub runtime_setup_command: Option<String>,
    pub health_poll: RetryConfig,
    #[serde(with = "humantime_serde")]
    pub health_poll_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub step_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub install_timeout: Duration,
}

impl Default for DeployConfig {
    fn default() -> Self {
        DeployConfig {
            controller_url: "http://localhost:8000".to_string(),
            broker_url: "redis://localhost:6379".to_string(),
            agent_root: "/opt/ioforge-agent".to_string(),
            agent_package_dir: PathBuf::from("agent"),
            agent_log_path: "/var/log/ioforge-agent.log".to_string(),
            runtime_setup_command: None,
            health_poll: RetryConfig {
                max_attempts: 5,
                min_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(2),
                multiplier: 1.0,
            },
            health_poll_timeout: Duration::from_secs(5),
            step_timeout: Duration::from_secs(60),
            install_timeout: Duration::from_secs(180),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on concurrent remote sessions during fan-out.
    pub fanout_limit: usize,
    /// Extra time granted to a benchmark run beyond the workload duration.
    #[serde(with = "humantime_serde")]
    pub run_grace: Duration,
    /// Default timeout for a single remote command.
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Timeout for benchmark tool installation.
    #[serde(with = "humantime_serde")]
    pub install_timeout: Duration,
    /// Window over which streamed per-worker samples are fused.
    #[serde(with = "humantime_serde")]
    pub aggregation_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            fanout_limit: 64,
            run_grace: Duration::from_secs(120),
            command_timeout: Duration::from_secs(60),
            install_timeout: Duration::from_secs(300),
            aggregation_window: Duration::from_secs(5),
        }
    }
}

pub fn make_config_loader() -> ConfigLoader<ManagerConfig> {
    ConfigLoader::new(&PathBuf::from("config/manager.toml"))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::make_config_loader;

    #[test]
    pub fn config_is_loadable() {
        make_config_loader().load().expect("Failed to load config");
    }
}
