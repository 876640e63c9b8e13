//! Transport trait definitions
//!
//! Both the in-process simulator and the TCP transport implement these.

use async_trait::async_trait;

use super::topic::{DiscoveryKey, JoinOptions};
use super::{FabricError, PeerId};

/// An established duplex byte stream to one peer.
///
/// Messages are delivered whole and in order.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Queue a message onto the stream.
    async fn send(&self, data: &[u8]) -> Result<(), FabricError>;

    /// Wait for the next message. Fails once the stream is closed by
    /// either side.
    async fn recv(&self) -> Result<Vec<u8>, FabricError>;

    async fn close(&self) -> Result<(), FabricError>;

    fn peer_id(&self) -> &PeerId;

    fn is_connected(&self) -> bool;
}

/// Output of a discovery mechanism.
pub enum DiscoveryEvent {
    /// A peer on a joined topic is connected and ready.
    Connected {
        key: DiscoveryKey,
        connection: Box<dyn PeerConnection>,
    },
    /// Looking for or accepting peers failed. Not retried.
    Failed {
        key: Option<DiscoveryKey>,
        error: FabricError,
    },
}

/// Finds peers for topics and produces connected streams.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Start announcing and/or searching for `key`.
    async fn join(&self, key: DiscoveryKey, options: JoinOptions) -> Result<(), FabricError>;

    /// Stop announcing and searching for `key`. Existing connections are
    /// left to the caller.
    async fn leave(&self, key: &DiscoveryKey) -> Result<(), FabricError>;

    /// Next discovery event, or `None` once shut down.
    async fn next_event(&self) -> Option<DiscoveryEvent>;

    /// Stop all discovery. Idempotent.
    async fn shutdown(&self) -> Result<(), FabricError>;
}
