//! # Node Configuration
//!
//! Configuration surface for a single runtime node. The bootstrap that reads
//! this and launches a node lives outside the runtime; everything a node needs
//! to join a cluster is described by [`NodeConfig`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use node_config::NodeConfig;
//!
//! let config = NodeConfig::load(Some(std::path::Path::new("node.toml")))?;
//! config.validate()?;
//! println!("{} listening on {}:{}", config.node_name, config.host, config.port);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod defaults;
pub mod logging;
pub mod node_config;

pub use logging::init_tracing;
pub use node_config::{load_config, NodeConfig};
