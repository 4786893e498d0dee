//! Default configuration values
//!
//! Constants used across the runtime crates so every node agrees on the same
//! baseline when a value is not configured explicitly.

/// Cluster membership defaults
pub mod cluster {
    /// Interface the node listens on
    pub const HOST: &str = "127.0.0.1";

    /// Default listen port
    pub const PORT: u16 = 4369;

    /// Heartbeat interval per link (milliseconds)
    pub const HEARTBEAT_INTERVAL_MS: u64 = 1_000;

    /// Consecutive missed heartbeats before a peer is declared down
    pub const HEARTBEAT_MISS_THRESHOLD: u32 = 3;

    /// Peer-set gossip interval (milliseconds)
    pub const GOSSIP_INTERVAL_MS: u64 = 1_000;

    /// TCP connect + handshake timeout (milliseconds)
    pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

    /// Largest frame accepted on a link (16MB)
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Environment variable prefix for overrides
    pub const ENV_PREFIX: &str = "MESH";
}

/// Remote messaging defaults
pub mod messaging {
    /// Timeout applied when callers do not pass one (milliseconds)
    pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 5_000;
}

/// Global registry defaults
pub mod registry {
    /// Anti-entropy snapshot interval (milliseconds)
    pub const SYNC_INTERVAL_MS: u64 = 5_000;
}

/// Logging defaults
pub mod logging {
    pub const LOG_LEVEL: &str = "info";
}
