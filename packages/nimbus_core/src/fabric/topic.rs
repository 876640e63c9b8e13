//! Discovery topics and keys

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Arbitrary bytes naming a rendezvous point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveryTopic(Vec<u8>);

impl DiscoveryTopic {
    pub fn new(topic: impl AsRef<[u8]>) -> Self {
        Self(topic.as_ref().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The fixed-size key peers actually rendezvous on.
    pub fn key(&self) -> DiscoveryKey {
        DiscoveryKey::from_topic(&self.0)
    }
}

impl From<&str> for DiscoveryTopic {
    fn from(topic: &str) -> Self {
        Self::new(topic)
    }
}

/// SHA-256 of a topic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoveryKey([u8; 32]);

impl DiscoveryKey {
    pub fn from_topic(topic: &[u8]) -> Self {
        Self(Sha256::digest(topic).into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({})", self.short())
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// How to participate in a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinOptions {
    /// Actively look for peers.
    pub discover: bool,
    /// Accept peers looking for us.
    pub announce: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            discover: true,
            announce: true,
        }
    }
}
