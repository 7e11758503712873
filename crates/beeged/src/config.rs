//! Node configuration.
//!
//! Settings come from an optional TOML file (named by `--config` or the
//! `BEEGE_CONFIG` environment variable) and are then overridden by command
//! line flags. Every field has a default, so an empty file is valid:
//!
//! ```toml
//! role = "docker"
//! cluster_address = "10.0.0.5:7000"
//! join_address = "10.0.0.1:9001"
//! status_interval_secs = 5
//! reconnect_backoff_ticks = 3
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use beege_core::{validate_address, DomainError, Role};

use crate::membership::{DiscoveryLimits, MembershipSettings, ReconnectPolicy};

/// Environment variable naming the default config file.
pub const CONFIG_ENV: &str = "BEEGE_CONFIG";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Full configuration of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub role: Option<Role>,

    /// Controller to bootstrap from
    pub join_address: Option<String>,

    /// Address advertised to (and, for controllers, listened on by) the
    /// cluster
    pub cluster_address: Option<String>,

    /// Controller service endpoint
    pub service_address: Option<String>,

    pub status_interval_secs: u64,
    pub reconnect_backoff_ticks: u32,
    pub max_reconnect_attempts: Option<u32>,
    pub broadcast_capacity: usize,
    pub discovery_max_depth: usize,
    pub discovery_max_peers: usize,
    pub dial_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            role: None,
            join_address: None,
            cluster_address: None,
            service_address: None,
            status_interval_secs: 5,
            reconnect_backoff_ticks: 3,
            max_reconnect_attempts: None,
            broadcast_capacity: 256,
            discovery_max_depth: 16,
            discovery_max_peers: 1024,
            dial_timeout_secs: 5,
        }
    }
}

impl ClusterConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Loads the file named by `BEEGE_CONFIG`, or the defaults if unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }

    /// Checks the settings required by the configured role.
    pub fn validate(&self) -> Result<Role, ConfigError> {
        let role = self.role.ok_or(ConfigError::Missing("role"))?;

        let cluster = self
            .cluster_address
            .as_deref()
            .ok_or(ConfigError::Missing("cluster_address"))?;
        validate_address(cluster)?;

        match role {
            Role::Controller => {
                let service = self
                    .service_address
                    .as_deref()
                    .ok_or(ConfigError::Missing("service_address"))?;
                validate_address(service)?;
            }
            Role::Docker => {
                self.join_address
                    .as_deref()
                    .ok_or(ConfigError::Missing("join_address"))?;
            }
        }
        if let Some(join) = self.join_address.as_deref() {
            validate_address(join)?;
        }

        if self.status_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "status_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.dial_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "dial_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_reconnect_attempts == Some(0) {
            return Err(ConfigError::Invalid {
                field: "max_reconnect_attempts",
                reason: "must be at least 1 when set".to_string(),
            });
        }

        Ok(role)
    }

    /// Membership tuning derived from this config.
    pub fn settings(&self) -> MembershipSettings {
        let dial_timeout = Duration::from_secs(self.dial_timeout_secs);
        MembershipSettings {
            dial_timeout,
            reply_timeout: dial_timeout,
            discovery: DiscoveryLimits {
                max_depth: self.discovery_max_depth,
                max_peers: self.discovery_max_peers,
            },
            reconnect: ReconnectPolicy {
                backoff_ticks: self.reconnect_backoff_ticks,
                max_attempts: self.max_reconnect_attempts,
                ..ReconnectPolicy::default()
            },
            status_interval: Duration::from_secs(self.status_interval_secs),
            mailbox_capacity: self.broadcast_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    fn docker_config() -> ClusterConfig {
        ClusterConfig {
            role: Some(Role::Docker),
            cluster_address: Some("10.0.0.5:7000".to_string()),
            join_address: Some("10.0.0.1:9001".to_string()),
            ..ClusterConfig::default()
        }
    }

    #[test]
    fn test_defaults_match_membership_defaults() {
        assert_eq!(ClusterConfig::default().settings(), MembershipSettings::default());
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(ClusterConfig::from_toml_str("").unwrap(), ClusterConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            role = "controller"
            cluster_address = "10.0.0.1:9001"
            service_address = "10.0.0.1:8080"
            status_interval_secs = 2
            max_reconnect_attempts = 10
            "#
        )
        .unwrap();

        let config = ClusterConfig::load(file.path()).unwrap();
        assert_eq!(config.role, Some(Role::Controller));
        assert_eq!(config.status_interval_secs, 2);
        assert_eq!(config.reconnect_backoff_ticks, 3);
        assert_eq!(config.validate().unwrap(), Role::Controller);

        let settings = config.settings();
        assert_eq!(settings.status_interval, Duration::from_secs(2));
        assert_eq!(settings.reconnect.max_attempts, Some(10));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = ClusterConfig::load(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            ClusterConfig::from_toml_str("role = \"router\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_docker_requires_join_address() {
        let config = ClusterConfig {
            join_address: None,
            ..docker_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("join_address"))
        ));
        assert_eq!(docker_config().validate().unwrap(), Role::Docker);
    }

    #[test]
    fn test_controller_requires_service_address() {
        let config = ClusterConfig {
            role: Some(Role::Controller),
            cluster_address: Some("10.0.0.1:9001".to_string()),
            ..ClusterConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("service_address"))
        ));
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = ClusterConfig {
            cluster_address: Some("10.0.0.5 7000".to_string()),
            ..docker_config()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Domain(_))));

        let config = ClusterConfig {
            status_interval_secs: 0,
            ..docker_config()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let config = ClusterConfig {
            max_reconnect_attempts: Some(0),
            ..docker_config()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }
}
