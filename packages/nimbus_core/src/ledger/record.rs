//! Payload formats for ledger inputs and output

use serde::{Deserialize, Serialize};

use crate::feed::{EntryHash, FeedPublicKey};

use super::clock::CausalClock;
use super::LedgerError;

/// Prefix marking an input payload as an encoded [`InputRecord`].
const INPUT_MAGIC: &[u8; 4] = b"NMB1";

/// What a writer appends to its input feed through the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    /// Entries of other writers merged when this one was written.
    pub deps: CausalClock,
    pub payload: Vec<u8>,
}

impl InputRecord {
    pub fn new(deps: CausalClock, payload: Vec<u8>) -> Self {
        Self { deps, payload }
    }

    pub fn encode(&self) -> Result<Vec<u8>, LedgerError> {
        let mut buf = INPUT_MAGIC.to_vec();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| LedgerError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    /// Interpret an input entry's bytes.
    ///
    /// Anything that is not an encoded record (including entries appended
    /// to the feed directly) is a bare payload with no dependencies.
    pub fn decode(bytes: &[u8]) -> Self {
        if let Some(body) = bytes.strip_prefix(INPUT_MAGIC.as_slice()) {
            if let Ok(record) = ciborium::from_reader::<Self, _>(body) {
                return record;
            }
        }
        Self {
            deps: CausalClock::new(),
            payload: bytes.to_vec(),
        }
    }
}

/// One entry of the ledger's output feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub writer: FeedPublicKey,
    /// Index of the merged entry in the writer's feed.
    pub index: u64,
    pub entry_hash: EntryHash,
    pub payload: Vec<u8>,
}

impl MergeRecord {
    pub fn encode(&self) -> Result<Vec<u8>, LedgerError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| LedgerError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    pub fn decode(output_index: u64, bytes: &[u8]) -> Result<Self, LedgerError> {
        ciborium::from_reader(bytes).map_err(|e| LedgerError::CorruptOutput {
            index: output_index,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_record_round_trip() {
        let mut deps = CausalClock::new();
        deps.observe(&FeedPublicKey::from_bytes([4; 32]), 2);
        let record = InputRecord::new(deps, b"payload".to_vec());
        assert_eq!(InputRecord::decode(&record.encode().unwrap()), record);
    }

    #[test]
    fn test_bare_bytes_have_no_deps() {
        let record = InputRecord::decode(b"plain text");
        assert!(record.deps.is_empty());
        assert_eq!(record.payload, b"plain text");

        // A lookalike prefix that is not a record stays a bare payload.
        let record = InputRecord::decode(b"NMB1garbage");
        assert_eq!(record.payload, b"NMB1garbage");
    }

    #[test]
    fn test_merge_record_rejects_garbage() {
        assert!(matches!(
            MergeRecord::decode(7, b"\xff\xff"),
            Err(LedgerError::CorruptOutput { index: 7, .. })
        ));
    }
}
