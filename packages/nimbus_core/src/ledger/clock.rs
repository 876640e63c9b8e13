//! Causal context of ledger entries
//!
//! A CausalClock records, per writer, how many of that writer's entries
//! the author had merged when it wrote an entry. An entry is ready to merge
//! once the ledger has merged at least that much of every writer it names.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::feed::FeedPublicKey;

/// Per-writer entry counts. Absent writers count as 0.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(FeedPublicKey, u64)>", into = "Vec<(FeedPublicKey, u64)>")]
pub struct CausalClock {
    seen: BTreeMap<FeedPublicKey, u64>,
}

impl CausalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries seen from `writer` (0 if never seen).
    pub fn get(&self, writer: &FeedPublicKey) -> u64 {
        self.seen.get(writer).copied().unwrap_or(0)
    }

    /// Raise the count for `writer`; never goes backwards.
    pub fn observe(&mut self, writer: &FeedPublicKey, count: u64) {
        if count == 0 {
            return;
        }
        let current = self.seen.entry(*writer).or_insert(0);
        if count > *current {
            *current = count;
        }
    }

    /// Take the max of each writer.
    pub fn merge(&mut self, other: &CausalClock) {
        for (writer, count) in &other.seen {
            self.observe(writer, *count);
        }
    }

    /// Has this clock seen everything `other` has?
    pub fn dominates(&self, other: &CausalClock) -> bool {
        other.seen.iter().all(|(w, c)| self.get(w) >= *c)
    }

    pub fn is_concurrent_with(&self, other: &CausalClock) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Writers with a non-zero count, in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&FeedPublicKey, u64)> {
        self.seen.iter().map(|(w, c)| (w, *c))
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Forget a writer.
    pub fn remove(&mut self, writer: &FeedPublicKey) {
        self.seen.remove(writer);
    }
}

impl From<Vec<(FeedPublicKey, u64)>> for CausalClock {
    fn from(pairs: Vec<(FeedPublicKey, u64)>) -> Self {
        let mut clock = Self::new();
        for (writer, count) in pairs {
            clock.observe(&writer, count);
        }
        clock
    }
}

impl From<CausalClock> for Vec<(FeedPublicKey, u64)> {
    fn from(clock: CausalClock) -> Self {
        clock.seen.into_iter().collect()
    }
}
