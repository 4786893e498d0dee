//! Tracing subscriber bootstrap
//!
//! Library crates only emit `tracing` events. Binaries and test harnesses call
//! [`init_tracing`] once to install a formatter.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` wins over `default_level` when set. Calling this twice returns an
/// error instead of panicking.
pub fn init_tracing(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("Invalid log filter '{}': {}", default_level, e))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        // First call may race with other tests installing a subscriber
        let _ = init_tracing("debug");
        assert!(init_tracing("debug").is_err());
    }
}
