//! Server configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_millis;
use crate::error::ConfigError;

/// Port the capture agent connects to unless told otherwise
pub const DEFAULT_PORT: u16 = 50051;

/// Image name identifying the capture agent's own container
pub const AGENT_IMAGE: &str = "traycer/trayce_agent";

/// Configuration for the agent server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the agent listener binds to
    pub bind_address: String,

    /// How often the heartbeat monitor checks liveness
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Silence after which the agent is considered disconnected
    #[serde(with = "duration_millis")]
    pub heartbeat_timeout: Duration,

    /// Queue depth at which a pending-command backlog is logged
    pub command_backlog_warn: usize,

    /// Capacity of the observer broadcast channel
    pub observer_capacity: usize,

    /// Backoff used by the agent client when reconnecting
    pub backoff: BackoffConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{}", DEFAULT_PORT),
            heartbeat_interval: Duration::from_millis(250),
            heartbeat_timeout: Duration::from_secs(1),
            command_backlog_warn: 256,
            observer_capacity: 1024,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Port component of the bind address
    pub fn port(&self) -> u16 {
        self.bind_address
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat_interval must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout must be greater than zero".to_string(),
            ));
        }
        if self.observer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "observer_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Command a user runs to start the capture agent against this server
    pub fn agent_run_command(&self, host_ip: &str) -> String {
        format!(
            "docker run --pid=host --privileged -v /var/run/docker.sock:/var/run/docker.sock -t {} -grpcaddr {}:{}",
            AGENT_IMAGE,
            host_ip,
            self.port()
        )
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0:50051");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(1));
        assert!(config.heartbeat_interval < config.heartbeat_timeout);
    }

    #[test]
    fn test_validate() {
        assert!(ServerConfig::default().validate().is_ok());

        let config = ServerConfig {
            heartbeat_interval: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = ServerConfig {
            heartbeat_timeout: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_interval_from_toml_is_rejected() {
        let config: ServerConfig = toml::from_str("heartbeat_interval = 0").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeat_interval"));
    }

    #[test]
    fn test_port_from_bind_address() {
        let config = ServerConfig {
            bind_address: "[::]:6001".to_string(),
            ..ServerConfig::default()
        };
        assert_eq!(config.port(), 6001);

        let config = ServerConfig {
            bind_address: "localhost".to_string(),
            ..ServerConfig::default()
        };
        assert_eq!(config.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_agent_run_command() {
        let cmd = ServerConfig::default().agent_run_command("192.168.0.10");
        assert!(cmd.starts_with("docker run --pid=host --privileged"));
        assert!(cmd.contains("-t traycer/trayce_agent"));
        assert!(cmd.ends_with("-grpcaddr 192.168.0.10:50051"));
    }

    #[test]
    fn test_rendered_image_is_detected_as_agent() {
        let cmd = ServerConfig::default().agent_run_command("10.0.0.1");
        let image = cmd
            .split_whitespace()
            .skip_while(|arg| *arg != "-t")
            .nth(1)
            .unwrap();

        let container = crate::types::Container {
            id: "c1".to_string(),
            name: "agent".to_string(),
            status: "running".to_string(),
            image: image.to_string(),
            ip: "172.17.0.2".to_string(),
        };
        assert!(container.is_agent());
    }
}
