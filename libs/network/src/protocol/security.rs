//! Shared-secret handshake material
//!
//! The cluster secret never leaves the node. Peers exchange its SHA3-256
//! digest and compare digests.

use sha3::{Digest, Sha3_256};
use std::fmt;

/// Digest of the cluster secret
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret {
    digest: [u8; 32],
}

impl SharedSecret {
    pub fn new(secret: &str) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(b"mesh-cluster-secret:");
        hasher.update(secret.as_bytes());
        Self {
            digest: hasher.finalize().into(),
        }
    }

    pub fn digest(&self) -> [u8; 32] {
        self.digest
    }

    /// Compare against a digest received from a peer
    pub fn verify(&self, digest: &[u8; 32]) -> bool {
        // Constant time over the whole digest
        self.digest
            .iter()
            .zip(digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret({}..)", hex::encode(&self.digest[..4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_secret_verifies() {
        let a = SharedSecret::new("cookie");
        let b = SharedSecret::new("cookie");
        assert!(a.verify(&b.digest()));
    }

    #[test]
    fn test_different_secret_fails() {
        let a = SharedSecret::new("cookie");
        let b = SharedSecret::new("biscuit");
        assert!(!a.verify(&b.digest()));
        assert!(!SharedSecret::new("").verify(&a.digest()));
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let s = format!("{:?}", SharedSecret::new("hunter2"));
        assert!(!s.contains("hunter2"));
    }
}
