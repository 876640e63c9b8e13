//! Peer Fabric
//!
//! Topic-scoped peer discovery and duplex messaging. A [`Discovery`]
//! implementation finds peers and hands over connected byte streams;
//! [`PeerFabric`] owns those streams, runs one receive loop per peer and
//! republishes everything as [`FabricEvent`]s.

pub mod simulated;
pub mod swarm;
pub mod tcp;
pub mod topic;
pub mod transport;

pub use simulated::{SimNetwork, SimNode};
pub use swarm::{BroadcastReport, FabricEvent, PeerFabric};
pub use tcp::TcpDiscovery;
pub use topic::{DiscoveryKey, DiscoveryTopic, JoinOptions};
pub use transport::{Discovery, DiscoveryEvent, PeerConnection};

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque identifier of a connected peer (`host:port` for TCP peers).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FabricError {
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Connection to {0} closed")]
    ConnectionClosed(PeerId),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Frame exceeds limit ({size} > {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Fabric is closed")]
    Closed,

    #[error("Serialization error: {0}")]
    SerializationError(String),
}
