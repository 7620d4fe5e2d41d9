//! Configuration types for gpuplug

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::resource::Resources;

/// Main plugin configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Behavioral flags
    pub flags: Flags,
    /// Resource matching rules
    pub resources: Resources,
    /// Health monitoring configuration
    pub health: HealthConfig,
    /// API server configuration
    pub api: ApiConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl PluginConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::PluginError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Flags controlling inventory building
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Flags {
    /// How partitioned GPUs are exposed
    pub mig_strategy: MigStrategy,
    /// Fail the build instead of degrading when the hardware is unusable
    pub fail_on_init_error: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            mig_strategy: MigStrategy::None,
            fail_on_init_error: true,
        }
    }
}

/// Partition strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigStrategy {
    /// Partitions are ignored; every GPU is exposed whole
    #[default]
    None,
    /// All partitions share one profile and one resource
    Single,
    /// Each partition profile gets its own resource
    Mixed,
}

impl std::fmt::Display for MigStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigStrategy::None => write!(f, "none"),
            MigStrategy::Single => write!(f, "single"),
            MigStrategy::Mixed => write!(f, "mixed"),
        }
    }
}

impl FromStr for MigStrategy {
    type Err = crate::PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(MigStrategy::None),
            "single" => Ok(MigStrategy::Single),
            "mixed" => Ok(MigStrategy::Mixed),
            other => Err(crate::PluginError::Config(format!(
                "unknown mig strategy: {}",
                other
            ))),
        }
    }
}

/// Health monitoring configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Skip health monitoring entirely
    pub disabled: bool,
    /// Xid codes to ignore in addition to the application-level ones
    pub ignored_xids: Vec<u64>,
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 9095,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log file path (if any)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plugin_config() {
        let config = PluginConfig::default();
        assert_eq!(config.flags.mig_strategy, MigStrategy::None);
        assert!(config.flags.fail_on_init_error);
        assert!(config.resources.is_empty());
        assert_eq!(config.api.port, 9095);
    }

    #[test]
    fn test_plugin_config_parse() {
        let toml_str = r#"
[flags]
mig_strategy = "mixed"
fail_on_init_error = false

[health]
ignored_xids = [48, 79]

[[resources.gpus]]
pattern = "*A100*"
name = "a100"
"#;
        let config: PluginConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.flags.mig_strategy, MigStrategy::Mixed);
        assert!(!config.flags.fail_on_init_error);
        assert_eq!(config.health.ignored_xids, vec![48, 79]);
        assert_eq!(config.resources.gpus[0].name.as_str(), "nvidia.com/a100");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir().join(format!("gpuplug-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let good = dir.join("good.toml");
        std::fs::write(&good, "[flags]\nmig_strategy = \"single\"\n").unwrap();
        let config = PluginConfig::from_file(&good).unwrap();
        assert_eq!(config.flags.mig_strategy, MigStrategy::Single);

        let bad = dir.join("bad.toml");
        std::fs::write(&bad, "[flags]\nmig_strategy = \"sometimes\"\n").unwrap();
        let err = PluginConfig::from_file(&bad).unwrap_err();
        assert!(matches!(err, crate::PluginError::Config(_)));

        let err = PluginConfig::from_file(&dir.join("missing.toml")).unwrap_err();
        assert!(matches!(err, crate::PluginError::Io(_)));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_mig_strategy_from_str() {
        assert_eq!("Single".parse::<MigStrategy>().unwrap(), MigStrategy::Single);
        assert!("uniform".parse::<MigStrategy>().is_err());
    }
}
