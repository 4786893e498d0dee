//! Node Configuration Module
//!
//! Loads the configuration surface of a node from an optional TOML file
//! layered with `MESH_*` environment overrides.

use crate::defaults;
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Everything a node needs to start and join a cluster
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name; the node id is `node_name@host:port`
    pub node_name: String,

    /// Interface to bind and advertise
    pub host: String,

    /// Listen port (0 picks an ephemeral port)
    pub port: u16,

    /// Seed addresses, either `host:port` or `name@host:port`
    pub seeds: Vec<String>,

    pub heartbeat_interval_ms: u64,
    pub heartbeat_miss_threshold: u32,

    /// Shared secret every node of the cluster must agree on
    pub cluster_secret: String,

    pub gossip_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub registry_sync_interval_ms: u64,
    pub default_call_timeout_ms: u64,
    pub max_frame_size: usize,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "node".to_string(),
            host: defaults::cluster::HOST.to_string(),
            port: defaults::cluster::PORT,
            seeds: Vec::new(),
            heartbeat_interval_ms: defaults::cluster::HEARTBEAT_INTERVAL_MS,
            heartbeat_miss_threshold: defaults::cluster::HEARTBEAT_MISS_THRESHOLD,
            cluster_secret: String::new(),
            gossip_interval_ms: defaults::cluster::GOSSIP_INTERVAL_MS,
            connect_timeout_ms: defaults::cluster::CONNECT_TIMEOUT_MS,
            registry_sync_interval_ms: defaults::registry::SYNC_INTERVAL_MS,
            default_call_timeout_ms: defaults::messaging::DEFAULT_CALL_TIMEOUT_MS,
            max_frame_size: defaults::cluster::MAX_FRAME_SIZE,
            log_level: defaults::logging::LOG_LEVEL.to_string(),
        }
    }
}

impl NodeConfig {
    /// Config for a node named `node_name` on an ephemeral loopback port
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            port: 0,
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_seeds<I, S>(mut self, seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seeds = seeds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.cluster_secret = secret.into();
        self
    }

    /// Set heartbeat interval and miss threshold together
    pub fn with_heartbeat(mut self, interval_ms: u64, miss_threshold: u32) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self.heartbeat_miss_threshold = miss_threshold;
        self
    }

    pub fn with_gossip_interval(mut self, interval_ms: u64) -> Self {
        self.gossip_interval_ms = interval_ms;
        self
    }

    pub fn with_registry_sync_interval(mut self, interval_ms: u64) -> Self {
        self.registry_sync_interval_ms = interval_ms;
        self
    }

    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading node config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        // Override with environment variables (MESH_ prefix)
        builder = builder.add_source(
            Environment::with_prefix(defaults::cluster::ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("seeds")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut node: NodeConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        node.expand_env_vars()?;

        debug!(
            node_name = %node.node_name,
            port = node.port,
            seeds = node.seeds.len(),
            "Node configuration loaded"
        );
        Ok(node)
    }

    /// Expand `${VAR}` references in the secret and seed list
    pub fn expand_env_vars(&mut self) -> Result<()> {
        let secret = shellexpand::env(&self.cluster_secret)
            .context("Failed to expand cluster secret")?;
        self.cluster_secret = secret.to_string();

        for seed in &mut self.seeds {
            let expanded = shellexpand::env(seed.as_str()).context("Failed to expand seed address")?;
            *seed = expanded.to_string();
        }

        Ok(())
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            bail!("node_name must not be empty");
        }
        if self.node_name.contains('@') || self.node_name.contains(':') {
            bail!("node_name '{}' must not contain '@' or ':'", self.node_name);
        }
        if self.host.is_empty() {
            bail!("host must not be empty");
        }
        if self.heartbeat_interval_ms == 0 {
            bail!("heartbeat_interval_ms must be greater than zero");
        }
        if self.heartbeat_miss_threshold == 0 {
            bail!("heartbeat_miss_threshold must be greater than zero");
        }
        if self.gossip_interval_ms == 0 {
            bail!("gossip_interval_ms must be greater than zero");
        }
        if self.registry_sync_interval_ms == 0 {
            bail!("registry_sync_interval_ms must be greater than zero");
        }
        if self.max_frame_size < 1024 {
            bail!("max_frame_size {} is below the 1KB minimum", self.max_frame_size);
        }
        for seed in &self.seeds {
            let address = seed.rsplit('@').next().unwrap_or(seed.as_str());
            if !address.contains(':') {
                bail!("seed '{}' is not a host:port address", seed);
            }
        }
        Ok(())
    }

    /// Serialize back to TOML, e.g. to hand a generated config to another node
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).context("Failed to serialize configuration")
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn registry_sync_interval(&self) -> Duration {
        Duration::from_millis(self.registry_sync_interval_ms)
    }

    pub fn default_call_timeout(&self) -> Duration {
        Duration::from_millis(self.default_call_timeout_ms)
    }

    /// Upper bound on heartbeat-based failure detection
    pub fn failure_detection_window(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_miss_threshold
    }
}

/// Convenience function to load and validate configuration
pub fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    let config = NodeConfig::load(path)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("node.toml");

        let config_content = r#"
node_name = "alpha"
host = "127.0.0.1"
port = 9100
seeds = ["beta@127.0.0.1:9101", "127.0.0.1:9102"]
heartbeat_interval_ms = 250
heartbeat_miss_threshold = 4
cluster_secret = "s3cret"
"#;

        fs::write(&config_path, config_content).unwrap();

        let config = NodeConfig::load(Some(&config_path)).unwrap();

        assert_eq!(config.node_name, "alpha");
        assert_eq!(config.port, 9100);
        assert_eq!(config.seeds.len(), 2);
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(250));
        assert_eq!(config.heartbeat_miss_threshold, 4);
        assert_eq!(config.cluster_secret, "s3cret");
        // Unset fields fall back to defaults
        assert_eq!(config.gossip_interval_ms, defaults::cluster::GOSSIP_INTERVAL_MS);
        assert_eq!(config.failure_detection_window(), Duration::from_millis(1000));
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(NodeConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(NodeConfig::new("").validate().is_err());
        assert!(NodeConfig::new("a@b").validate().is_err());
        assert!(NodeConfig::new("a").with_heartbeat(0, 3).validate().is_err());
        assert!(NodeConfig::new("a").with_heartbeat(100, 0).validate().is_err());
        assert!(NodeConfig::new("a").with_seeds(["nohost"]).validate().is_err());
        assert!(NodeConfig::new("a")
            .with_seeds(["b@127.0.0.1:4000", "127.0.0.1:4001"])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("generated.toml");

        let original = NodeConfig::new("gamma")
            .with_port(9200)
            .with_secret("abc")
            .with_heartbeat(100, 5);
        fs::write(&config_path, original.to_toml_string().unwrap()).unwrap();

        let loaded = NodeConfig::load(Some(&config_path)).unwrap();
        assert_eq!(loaded, original);
    }
}
