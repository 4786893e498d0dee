//! Network Protocol Infrastructure
//!
//! Link frames and handshake security for the cluster layer.

pub mod envelope;
pub mod security;

// Re-export commonly used types
pub use envelope::{Frame, WireFormat};
pub use security::SharedSecret;
