// Nimbus - Verifiable feeds merged into a convergent ledger over a peer fabric

pub mod config;
pub mod fabric;
pub mod feed;
pub mod ledger;
pub mod sync;

pub use config::NimbusConfig;
pub use fabric::{PeerFabric, PeerId};
pub use feed::{Feed, FeedPublicKey, LocalFeed, MirroredFeed};
pub use ledger::Ledger;
pub use sync::Replicator;
