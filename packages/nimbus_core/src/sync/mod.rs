//! Replication between ledgers over the peer fabric
//!
//! Peers announce the heads of the feeds they hold, request the ranges
//! they are missing and answer with verified entries. Everything received
//! goes through the ledger, which verifies and merges it.

mod message;
mod replicator;

pub use message::SyncMessage;
pub use replicator::Replicator;

use thiserror::Error;

use crate::fabric::FabricError;
use crate::feed::FeedError;
use crate::ledger::LedgerError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Fabric error: {0}")]
    Fabric(#[from] FabricError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Replicator is closed")]
    Closed,
}
