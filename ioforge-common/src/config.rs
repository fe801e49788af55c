use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Environment variable prefix for configuration overrides
/// (`IOFORGE__ENGINE__FANOUT_LIMIT=16` overrides `engine.fanout_limit`).
const ENV_PREFIX: &str = "IOFORGE__";

pub trait ConfigLoaderConfig: Default + Serialize + DeserializeOwned {}

impl<T: Default + Serialize + DeserializeOwned> ConfigLoaderConfig for T {}

/// Layered configuration loader: compiled defaults, then the TOML file, then
/// environment overrides.
pub struct ConfigLoader<T: ConfigLoaderConfig> {
    pub config_file_name: PathBuf,
    phantom: PhantomData<T>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            phantom: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbSqliteConfig {
    pub database: String,
    pub max_connections: u32,
}

impl Default for DbSqliteConfig {
    fn default() -> Self {
        DbSqliteConfig {
            database: "data/ioforge.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the given 1-based attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.min_delay.as_secs_f64() * self.multiplier.powi(exp as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct SampleConfig {
        db: DbSqliteConfig,
        redis: RedisConfig,
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let loader: ConfigLoader<SampleConfig> =
            ConfigLoader::new(Path::new("does/not/exist.toml"));
        let config = loader.load().expect("defaults should load");
        assert_eq!(config, SampleConfig::default());
        assert_eq!(config.redis.url(), "redis://localhost:6379");
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manager.toml");
        std::fs::write(&path, "[db]\ndatabase = \"/tmp/other.db\"\n").unwrap();

        let loader: ConfigLoader<SampleConfig> = ConfigLoader::new(&path);
        let config = loader.load().unwrap();
        assert_eq!(config.db.database, "/tmp/other.db");
        assert_eq!(config.db.max_connections, 10);
    }

    #[test]
    fn retry_delays_grow_and_cap() {
        let retry = RetryConfig::default();
        assert!(retry.delay_for_attempt(1) < retry.delay_for_attempt(3));
        assert!(retry.delay_for_attempt(30) <= retry.max_delay);
    }
}
