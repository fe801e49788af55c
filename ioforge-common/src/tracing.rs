use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub service_name: String,
    /// Default directive when `RUST_LOG` is not set.
    pub default_directive: String,
    pub json: bool,
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        TracingConfig::local_dev("ioforge")
    }
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        TracingConfig {
            service_name: service_name.to_string(),
            default_directive: "info".to_string(),
            json: false,
            with_target: true,
        }
    }

    pub fn test(service_name: &str) -> Self {
        TracingConfig {
            service_name: service_name.to_string(),
            default_directive: "debug".to_string(),
            json: false,
            with_target: false,
        }
    }
}

fn env_filter(config: &TracingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_directive))
}

/// Install the global subscriber. Panics if one is already set; use
/// [`try_init_tracing`] from tests.
pub fn init_tracing(config: &TracingConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(config.with_target);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Best-effort subscriber installation; returns whether this call installed it.
pub fn try_init_tracing(config: &TracingConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(config.with_target);
    if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn test_profile_is_quieter_about_targets() {
        let config = TracingConfig::test("unit");
        assert!(!config.with_target);
        assert_eq!(config.default_directive, "debug");
    }
}
