//! Controller configuration.
//!
//! Defaults are code, `SILTA_*` environment variables override them at
//! startup.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::parser::DEFAULT_SCHEMA_LOCAL;

/// Backend resolution strategy, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// Pool members are cluster node addresses; the pool port is the
    /// service's nodePort.
    NodePort,
    /// Pool members are pod endpoint addresses with the port embedded in the
    /// address string.
    Cluster,
}

impl FromStr for PoolMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Error> {
        match value {
            "nodeport" => Ok(PoolMode::NodePort),
            "cluster" => Ok(PoolMode::Cluster),
            other => Err(Error::Config(format!(
                "unknown pool mode '{other}', expected 'nodeport' or 'cluster'"
            ))),
        }
    }
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolMode::NodePort => write!(f, "nodeport"),
            PoolMode::Cluster => write!(f, "cluster"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// The single namespace this controller watches.
    pub namespace: String,

    pub pool_mode: PoolMode,

    /// Select node InternalIP addresses instead of ExternalIP.
    pub use_node_internal: bool,

    /// Periodic full relist of every watched collection; 0 disables.
    pub resync_interval_secs: u64,

    /// How often the node list is polled in NodePort mode.
    pub node_poll_interval_secs: u64,

    /// Base URL replacing the `f5schemadb://` schema indicator.
    pub schema_local: String,

    /// Where the assembled config document is written.
    pub output_path: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            namespace: "default".to_string(),
            pool_mode: PoolMode::NodePort,
            use_node_internal: false,
            resync_interval_secs: 0,
            node_poll_interval_secs: 30,
            schema_local: DEFAULT_SCHEMA_LOCAL.to_string(),
            output_path: "/tmp/silta-config.json".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();

        if let Ok(val) = env::var("SILTA_NAMESPACE") {
            config.namespace = val;
        }
        if let Ok(val) = env::var("SILTA_POOL_MODE") {
            config.pool_mode = val.parse()?;
        }
        if let Ok(val) = env::var("SILTA_USE_NODE_INTERNAL") {
            config.use_node_internal = parse_field("SILTA_USE_NODE_INTERNAL", &val)?;
        }
        if let Ok(val) = env::var("SILTA_RESYNC_INTERVAL_SECS") {
            config.resync_interval_secs = parse_field("SILTA_RESYNC_INTERVAL_SECS", &val)?;
        }
        if let Ok(val) = env::var("SILTA_NODE_POLL_INTERVAL_SECS") {
            config.node_poll_interval_secs = parse_field("SILTA_NODE_POLL_INTERVAL_SECS", &val)?;
        }
        if let Ok(val) = env::var("SILTA_SCHEMA_LOCAL") {
            config.schema_local = val;
        }
        if let Ok(val) = env::var("SILTA_OUTPUT_PATH") {
            config.output_path = val;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace.is_empty() {
            return Err(Error::Config("namespace must not be empty".to_string()));
        }
        if self.node_poll_interval_secs == 0 {
            return Err(Error::Config(
                "node poll interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Resync period for the watchers, if enabled.
    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_secs > 0).then(|| Duration::from_secs(self.resync_interval_secs))
    }
}

fn parse_field<T: FromStr>(name: &str, value: &str) -> Result<T, Error> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid value '{value}' for {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.pool_mode, PoolMode::NodePort);
        assert!(!config.use_node_internal);
        assert_eq!(config.resync_interval(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn pool_mode_parses_both_values() {
        assert_eq!("nodeport".parse::<PoolMode>().unwrap(), PoolMode::NodePort);
        assert_eq!("cluster".parse::<PoolMode>().unwrap(), PoolMode::Cluster);
        assert!("udp".parse::<PoolMode>().is_err());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let config = ControllerConfig {
            namespace: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ControllerConfig {
            node_poll_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn resync_interval_zero_disables() {
        let config = ControllerConfig {
            resync_interval_secs: 30,
            ..Default::default()
        };
        assert_eq!(config.resync_interval(), Some(Duration::from_secs(30)));
    }
}
