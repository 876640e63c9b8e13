//! Convergent Ledger
//!
//! Merges many single-writer feeds (inputs) into one linear output feed.
//! An input's next entry becomes ready once every causal dependency it
//! declares has been merged; ready entries are taken in writer-key order,
//! then index order, so ledgers fed the same inputs produce identical
//! output.

mod clock;
mod ledger_core;
mod record;

pub use clock::CausalClock;
pub use ledger_core::{InputFeed, Ledger, LedgerEvent, WriterState, WriterStatus};
pub use record::{InputRecord, MergeRecord};

use thiserror::Error;

use crate::feed::{FeedError, FeedPublicKey};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Writer {0} is not registered")]
    UnknownWriter(FeedPublicKey),

    #[error("Writer {0} has diverged and is isolated until resync")]
    WriterDiverged(FeedPublicKey),

    #[error("Writer {0} is local; its entries are not received from peers")]
    NotMirrored(FeedPublicKey),

    #[error("No local input feed is set")]
    NoLocalInput,

    #[error("No output feed is set")]
    NoOutput,

    #[error("Output index {index} out of range (length {length})")]
    OutOfRange { index: u64, length: u64 },

    #[error("Output entry {index} is not a merge record: {reason}")]
    CorruptOutput { index: u64, reason: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Ledger is closed")]
    Closed,
}
