//! Transport Layer
//!
//! Peer links run over TCP with length-prefixed frames.

pub mod tcp;

// Re-export transport types
pub use tcp::{FrameReader, FrameWriter, TcpConfig};
