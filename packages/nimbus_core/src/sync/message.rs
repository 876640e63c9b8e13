//! Replication protocol messages
//!
//! Sent as CBOR in fabric frames.

use serde::{Deserialize, Serialize};

use crate::feed::{FeedEntry, FeedHead, FeedPublicKey};

use super::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// "I hold this much of `writer`'s feed"
    Have { writer: FeedPublicKey, head: FeedHead },
    /// "Send me entries `from..to` of `writer`"
    Request { writer: FeedPublicKey, from: u64, to: u64 },
    /// Entries in index order, answering a request or pushing an append.
    Entries {
        writer: FeedPublicKey,
        entries: Vec<FeedEntry>,
    },
}

impl SyncMessage {
    pub fn writer(&self) -> &FeedPublicKey {
        match self {
            SyncMessage::Have { writer, .. }
            | SyncMessage::Request { writer, .. }
            | SyncMessage::Entries { writer, .. } => writer,
        }
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, SyncError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| SyncError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_cbor(data: &[u8]) -> Result<Self, SyncError> {
        ciborium::from_reader(data).map_err(|e| SyncError::SerializationError(e.to_string()))
    }
}
