//! Ledger state and the merge pass

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::LedgerConfig;
use crate::fabric::PeerId;
use crate::feed::{
    AuditReport, EntryHash, Feed, FeedEntry, FeedError, FeedHead, FeedPublicKey, LocalFeed,
    MirroredFeed, ReceiveOutcome, SyncState, GENESIS_HASH,
};

use super::clock::CausalClock;
use super::record::{InputRecord, MergeRecord};
use super::LedgerError;

/// An input feed: one we write, or a mirror of someone else's.
#[derive(Clone)]
pub enum InputFeed {
    Local(Arc<LocalFeed>),
    Mirrored(Arc<MirroredFeed>),
}

impl InputFeed {
    pub fn feed(&self) -> &dyn Feed {
        match self {
            InputFeed::Local(f) => f.as_ref(),
            InputFeed::Mirrored(f) => f.as_ref(),
        }
    }

    pub fn key(&self) -> FeedPublicKey {
        self.feed().key()
    }

    pub fn is_local(&self) -> bool {
        matches!(self, InputFeed::Local(_))
    }

    fn same_feed(&self, other: &InputFeed) -> bool {
        match (self, other) {
            (InputFeed::Local(a), InputFeed::Local(b)) => Arc::ptr_eq(a, b),
            (InputFeed::Mirrored(a), InputFeed::Mirrored(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Where an input stands with respect to merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriterState {
    Unregistered,
    /// Known, nothing announced or received yet.
    Registered,
    /// Known to have entries this ledger does not hold yet.
    Syncing,
    /// Syncing past the stall timeout. Still merges what arrives, but no
    /// longer holds other writers back.
    Stalled,
    CaughtUp,
    /// Isolated after a verification failure or contradicting history.
    Diverged,
}

/// Snapshot reported by [`Ledger::verify_writers`].
#[derive(Debug, Clone, Serialize)]
pub struct WriterStatus {
    pub state: WriterState,
    pub local: bool,
    pub head: FeedHead,
    /// Entries of this writer already in the output.
    pub merged: u64,
    pub audit: AuditReport,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    EntryMerged {
        output_index: u64,
        writer: FeedPublicKey,
        index: u64,
    },
    WriterDiverged {
        writer: FeedPublicKey,
        reason: String,
    },
    /// A writer stopped holding merges after syncing for too long.
    WriterStalled {
        writer: FeedPublicKey,
        held: u64,
        known: u64,
    },
    PeerConnected {
        peer: PeerId,
    },
    PeerDisconnected {
        peer: PeerId,
    },
}

struct InputState {
    feed: InputFeed,
    state: WriterState,
    since: DateTime<Utc>,
}

/// How much of one writer is in the output.
#[derive(Debug, Clone, Copy)]
struct Progress {
    merged: u64,
    /// Hash of the last merged entry; the next one must link to it.
    tip: EntryHash,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            merged: 0,
            tip: GENESIS_HASH,
        }
    }
}

/// Deterministic merge of many input feeds into one output feed.
///
/// All mutation goes through `&mut self`; share it behind a mutex.
pub struct Ledger {
    config: LedgerConfig,
    inputs: BTreeMap<FeedPublicKey, InputState>,
    local_writer: Option<FeedPublicKey>,
    output: Option<Arc<LocalFeed>>,
    frontier: BTreeMap<FeedPublicKey, Progress>,
    /// Writers named as dependencies that are not registered.
    unknown_writers: BTreeSet<FeedPublicKey>,
    events_tx: broadcast::Sender<LedgerEvent>,
    closed: bool,
}

impl Ledger {
    pub fn new(config: LedgerConfig) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            inputs: BTreeMap::new(),
            local_writer: None,
            output: None,
            frontier: BTreeMap::new(),
            unknown_writers: BTreeSet::new(),
            events_tx,
            closed: false,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events_tx.subscribe()
    }

    fn ensure_open(&self) -> Result<(), LedgerError> {
        if self.closed {
            Err(LedgerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Track a writer's feed. Registering the same feed again is a no-op.
    pub fn register_input(&mut self, feed: InputFeed) -> Result<(), LedgerError> {
        self.ensure_open()?;
        let key = feed.key();
        if let Some(existing) = self.inputs.get(&key) {
            if existing.feed.same_feed(&feed) {
                return Ok(());
            }
        }
        log::info!(
            "Registered {} input {}",
            if feed.is_local() { "local" } else { "mirrored" },
            key.short()
        );
        self.inputs.insert(
            key,
            InputState {
                feed,
                state: WriterState::Registered,
                since: Utc::now(),
            },
        );
        self.unknown_writers.remove(&key);
        self.refresh_state(&key);
        self.merge_pass()?;
        Ok(())
    }

    /// Register the feed this process writes through [`Ledger::append_local`].
    pub fn set_local_input(&mut self, feed: Arc<LocalFeed>) -> Result<(), LedgerError> {
        let key = feed.key();
        self.register_input(InputFeed::Local(feed))?;
        self.local_writer = Some(key);
        Ok(())
    }

    /// Set the feed merged entries are written to.
    ///
    /// A non-empty output is read back to restore the frontier, so a
    /// restarted ledger continues where it stopped.
    pub fn set_local_output(&mut self, feed: Arc<LocalFeed>) -> Result<(), LedgerError> {
        self.ensure_open()?;
        if !feed.is_writable() {
            return Err(FeedError::NotWritable.into());
        }

        let mut frontier: BTreeMap<FeedPublicKey, Progress> = BTreeMap::new();
        for output_index in 0..feed.len() {
            let record = MergeRecord::decode(output_index, &feed.get(output_index)?)?;
            let progress = frontier.entry(record.writer).or_default();
            if record.index != progress.merged {
                return Err(LedgerError::CorruptOutput {
                    index: output_index,
                    reason: format!(
                        "writer {} jumps from {} to {}",
                        record.writer.short(),
                        progress.merged,
                        record.index
                    ),
                });
            }
            progress.merged += 1;
            progress.tip = record.entry_hash;
        }

        if !frontier.is_empty() {
            log::info!(
                "Restored ledger frontier over {} writers from {} output entries",
                frontier.len(),
                feed.len()
            );
        }
        self.frontier = frontier;
        self.output = Some(feed);
        self.merge_pass()?;
        Ok(())
    }

    /// Append a payload to the local input, declaring everything merged so
    /// far as its causal dependencies. Returns the index in the local feed.
    pub fn append_local(&mut self, payload: impl Into<Vec<u8>>) -> Result<u64, LedgerError> {
        self.ensure_open()?;
        let key = self.local_writer.ok_or(LedgerError::NoLocalInput)?;
        let feed = match self.inputs.get(&key).map(|i| &i.feed) {
            Some(InputFeed::Local(feed)) => Arc::clone(feed),
            _ => return Err(LedgerError::NoLocalInput),
        };

        let mut deps = self.frontier_clock();
        deps.remove(&key);
        let record = InputRecord::new(deps, payload.into());
        let index = feed.append(record.encode()?)?;
        log::debug!("Local writer {} appended {}", key.short(), index);

        self.refresh_state(&key);
        self.merge_pass()?;
        Ok(index)
    }

    /// Payload of a merged entry.
    pub fn get(&self, output_index: u64) -> Result<Vec<u8>, LedgerError> {
        Ok(self.record(output_index)?.payload)
    }

    /// Full merge record at `output_index`.
    pub fn record(&self, output_index: u64) -> Result<MergeRecord, LedgerError> {
        let output = self.output.as_ref().ok_or(LedgerError::NoOutput)?;
        match output.get(output_index) {
            Ok(bytes) => MergeRecord::decode(output_index, &bytes),
            Err(FeedError::OutOfRange { index, length }) => {
                Err(LedgerError::OutOfRange { index, length })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn output_len(&self) -> u64 {
        self.output.as_ref().map(|o| o.len()).unwrap_or(0)
    }

    pub fn output(&self) -> Option<&Arc<LocalFeed>> {
        self.output.as_ref()
    }

    pub fn local_writer(&self) -> Option<FeedPublicKey> {
        self.local_writer
    }

    pub fn input(&self, writer: &FeedPublicKey) -> Option<&InputFeed> {
        self.inputs.get(writer).map(|i| &i.feed)
    }

    pub fn writers(&self) -> Vec<FeedPublicKey> {
        self.inputs.keys().copied().collect()
    }

    pub fn writer_state(&self, writer: &FeedPublicKey) -> WriterState {
        self.inputs
            .get(writer)
            .map(|i| i.state)
            .unwrap_or(WriterState::Unregistered)
    }

    /// Entries merged per writer.
    pub fn frontier_clock(&self) -> CausalClock {
        let mut clock = CausalClock::new();
        for (writer, progress) in &self.frontier {
            clock.observe(writer, progress.merged);
        }
        clock
    }

    /// Writers some pending entry depends on that nobody registered.
    pub fn unknown_writers(&self) -> Vec<FeedPublicKey> {
        self.unknown_writers.iter().copied().collect()
    }

    /// Offer an entry of a mirrored writer received from a peer.
    ///
    /// An entry that fails verification or contradicts the held chain
    /// isolates the writer.
    pub fn ingest(
        &mut self,
        writer: &FeedPublicKey,
        entry: FeedEntry,
    ) -> Result<ReceiveOutcome, LedgerError> {
        self.ensure_open()?;
        let mirror = self.mirror_of(writer)?;

        match mirror.receive(entry) {
            Ok(outcome) => {
                if outcome != ReceiveOutcome::Duplicate {
                    // A syncing writer that keeps delivering is not stalled.
                    if let Some(input) = self.inputs.get_mut(writer) {
                        if input.state == WriterState::Syncing {
                            input.since = Utc::now();
                        }
                    }
                }
                self.refresh_state(writer);
                if matches!(outcome, ReceiveOutcome::Accepted { .. }) {
                    self.merge_pass()?;
                }
                Ok(outcome)
            }
            Err(e @ (FeedError::VerificationFailure { .. } | FeedError::Divergence { .. })) => {
                self.isolate(writer, e.to_string());
                self.merge_pass()?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record the head a peer announced for a writer.
    pub fn note_remote_head(
        &mut self,
        writer: &FeedPublicKey,
        head: &FeedHead,
    ) -> Result<(), LedgerError> {
        self.ensure_open()?;
        let input = self
            .inputs
            .get(writer)
            .ok_or(LedgerError::UnknownWriter(*writer))?;
        let mirror = match &input.feed {
            // We are the source of truth for our own feed.
            InputFeed::Local(_) => return Ok(()),
            InputFeed::Mirrored(m) => Arc::clone(m),
        };
        if input.state == WriterState::Diverged {
            return Err(LedgerError::WriterDiverged(*writer));
        }

        match mirror.note_remote_head(head) {
            Ok(()) => {
                self.refresh_state(writer);
                Ok(())
            }
            Err(e @ FeedError::Divergence { .. }) => {
                self.isolate(writer, e.to_string());
                self.merge_pass()?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop a writer's mirrored history so it can be refetched from index 0.
    ///
    /// Whatever is refetched must extend the entries already merged, or the
    /// writer is isolated again.
    pub fn resync(&mut self, writer: &FeedPublicKey) -> Result<(), LedgerError> {
        self.ensure_open()?;
        let input = self
            .inputs
            .get(writer)
            .ok_or(LedgerError::UnknownWriter(*writer))?;
        let mirror = match &input.feed {
            InputFeed::Mirrored(m) => Arc::clone(m),
            InputFeed::Local(_) => return Err(LedgerError::NotMirrored(*writer)),
        };
        mirror.reset()?;
        if let Some(input) = self.inputs.get_mut(writer) {
            input.state = WriterState::Registered;
            input.since = Utc::now();
        }
        log::info!("Resyncing writer {} from index 0", writer.short());
        Ok(())
    }

    fn mirror_of(&self, writer: &FeedPublicKey) -> Result<Arc<MirroredFeed>, LedgerError> {
        let input = self
            .inputs
            .get(writer)
            .ok_or(LedgerError::UnknownWriter(*writer))?;
        if input.state == WriterState::Diverged {
            return Err(LedgerError::WriterDiverged(*writer));
        }
        match &input.feed {
            InputFeed::Mirrored(m) => Ok(Arc::clone(m)),
            InputFeed::Local(_) => Err(LedgerError::NotMirrored(*writer)),
        }
    }

    /// Recheck every input's chain and report where it stands.
    pub fn verify_writers(&self) -> BTreeMap<FeedPublicKey, WriterStatus> {
        self.inputs
            .iter()
            .map(|(key, input)| {
                let feed = input.feed.feed();
                let status = WriterStatus {
                    state: input.state,
                    local: input.feed.is_local(),
                    head: feed.head(),
                    merged: self.frontier.get(key).map(|p| p.merged).unwrap_or(0),
                    audit: feed.audit(),
                    since: input.since,
                };
                (*key, status)
            })
            .collect()
    }

    /// How long a writer may stay syncing, if bounded.
    pub fn stall_timeout(&self) -> Option<std::time::Duration> {
        match self.config.stall_timeout_ms {
            0 => None,
            ms => Some(std::time::Duration::from_millis(ms)),
        }
    }

    /// Release writers that have been syncing since before `now` minus the
    /// stall timeout, then merge what they were holding back.
    ///
    /// Returns the writers released by this call.
    pub fn expire_stalled(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<FeedPublicKey>, LedgerError> {
        self.ensure_open()?;
        let Some(timeout) = self.stall_timeout() else {
            return Ok(Vec::new());
        };

        let mut released = Vec::new();
        for (writer, input) in self.inputs.iter_mut() {
            if input.state != WriterState::Syncing {
                continue;
            }
            let waited = (now - input.since).to_std().unwrap_or_default();
            if waited < timeout {
                continue;
            }
            input.state = WriterState::Stalled;
            input.since = now;
            let held = input.feed.feed().len();
            let known = match &input.feed {
                InputFeed::Mirrored(m) => m.known_length(),
                InputFeed::Local(_) => held,
            };
            log::warn!(
                "Writer {} stalled at {}/{} entries; no longer holding merges",
                writer.short(),
                held,
                known
            );
            let _ = self.events_tx.send(LedgerEvent::WriterStalled {
                writer: *writer,
                held,
                known,
            });
            released.push(*writer);
        }

        if !released.is_empty() {
            self.merge_pass()?;
        }
        Ok(released)
    }

    pub(crate) fn peer_connected(&self, peer: PeerId) {
        let _ = self.events_tx.send(LedgerEvent::PeerConnected { peer });
    }

    pub(crate) fn peer_disconnected(&self, peer: PeerId) {
        let _ = self.events_tx.send(LedgerEvent::PeerDisconnected { peer });
    }

    /// Close the output. Later mutations fail with `Closed`. Idempotent.
    pub fn close(&mut self) -> Result<(), LedgerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(output) = &self.output {
            output.close()?;
        }
        log::info!("Ledger closed with {} output entries", self.output_len());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn isolate(&mut self, writer: &FeedPublicKey, reason: String) {
        if let Some(input) = self.inputs.get_mut(writer) {
            if input.state == WriterState::Diverged {
                return;
            }
            input.state = WriterState::Diverged;
            input.since = Utc::now();
        }
        log::warn!("Isolating writer {}: {}", writer.short(), reason);
        let _ = self.events_tx.send(LedgerEvent::WriterDiverged {
            writer: *writer,
            reason,
        });
    }

    fn refresh_state(&mut self, writer: &FeedPublicKey) {
        let Some(input) = self.inputs.get_mut(writer) else {
            return;
        };
        if input.state == WriterState::Diverged {
            return;
        }
        let next = match &input.feed {
            InputFeed::Local(_) => WriterState::CaughtUp,
            InputFeed::Mirrored(m) => match m.sync_state() {
                SyncState::Syncing { .. } => WriterState::Syncing,
                SyncState::CaughtUp if m.is_empty() && m.known_length() == 0 => {
                    WriterState::Registered
                }
                SyncState::CaughtUp => WriterState::CaughtUp,
            },
        };
        // Only arriving entries move a stalled writer on; a repeated head
        // announcement must not put it back in the way.
        if input.state == WriterState::Stalled && next == WriterState::Syncing {
            return;
        }
        if next != input.state {
            log::debug!("Writer {} {:?} -> {:?}", writer.short(), input.state, next);
            input.state = next;
            input.since = Utc::now();
        }
    }

    /// Merge every ready entry. Returns the output indices written.
    ///
    /// With `require_caught_up`, only the local writer merges while an
    /// input is syncing. Stalled writers do not count as syncing.
    pub fn merge_pass(&mut self) -> Result<Vec<u64>, LedgerError> {
        let mut merged = Vec::new();
        let Some(output) = self.output.clone() else {
            return Ok(merged);
        };
        if self.closed {
            return Ok(merged);
        }
        let held = self.config.require_caught_up
            && self
                .inputs
                .values()
                .any(|i| i.state == WriterState::Syncing);
        if held {
            log::debug!("Merge of remote writers held: inputs still syncing");
        }

        self.unknown_writers.clear();
        loop {
            let Some((writer, entry, record)) = self.next_ready(held) else {
                break;
            };

            let merge = MergeRecord {
                writer,
                index: entry.index,
                entry_hash: entry.hash,
                payload: record.payload,
            };
            let output_index = output.append(merge.encode()?)?;

            let progress = self.frontier.entry(writer).or_default();
            progress.merged += 1;
            progress.tip = entry.hash;

            log::debug!(
                "Merged {}:{} as output {}",
                writer.short(),
                entry.index,
                output_index
            );
            let _ = self.events_tx.send(LedgerEvent::EntryMerged {
                output_index,
                writer,
                index: entry.index,
            });
            merged.push(output_index);
        }
        Ok(merged)
    }

    /// The first ready entry in writer-key order, isolating writers whose
    /// next entry no longer fits the merged history. `local_only` limits
    /// the scan to the local writer.
    fn next_ready(
        &mut self,
        local_only: bool,
    ) -> Option<(FeedPublicKey, FeedEntry, InputRecord)> {
        let mut faults = Vec::new();
        let mut ready = None;

        for (writer, input) in &self.inputs {
            if input.state == WriterState::Diverged || (local_only && !input.feed.is_local()) {
                continue;
            }
            let feed = input.feed.feed();
            let progress = self.frontier.get(writer).copied().unwrap_or_default();
            if progress.merged >= feed.len() {
                continue;
            }

            let entry = match feed.entry(progress.merged) {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            if !feed.verify(progress.merged) {
                faults.push((*writer, format!("entry {} fails verification", entry.index)));
                continue;
            }
            if entry.prev_hash != progress.tip {
                faults.push((
                    *writer,
                    format!("entry {} does not extend merged history", entry.index),
                ));
                continue;
            }

            let record = InputRecord::decode(&entry.payload);
            let mut blocked = false;
            for (dep, count) in record.deps.iter() {
                if dep == writer {
                    continue;
                }
                let have = self.frontier.get(dep).map(|p| p.merged).unwrap_or(0);
                if have < count {
                    blocked = true;
                    if !self.inputs.contains_key(dep) {
                        self.unknown_writers.insert(*dep);
                    }
                }
            }
            if !blocked {
                ready = Some((*writer, entry, record));
                break;
            }
        }

        for (writer, reason) in faults {
            self.isolate(&writer, reason);
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FeedKeypair, FeedStorage, MemoryStorage};

    fn ledger() -> Ledger {
        let mut ledger = Ledger::new(LedgerConfig::default());
        ledger
            .set_local_output(Arc::new(LocalFeed::create(None)))
            .unwrap();
        ledger
    }

    /// Two writers whose keys order as (low, high).
    fn ordered_writers() -> (LocalFeed, LocalFeed) {
        let a = LocalFeed::create(None);
        let b = LocalFeed::create(None);
        if a.key() < b.key() {
            (a, b)
        } else {
            (b, a)
        }
    }

    fn payloads(ledger: &Ledger) -> Vec<Vec<u8>> {
        (0..ledger.output_len())
            .map(|i| ledger.get(i).unwrap())
            .collect()
    }

    fn mirror_into(ledger: &mut Ledger, source: &LocalFeed) -> Arc<MirroredFeed> {
        let mirror = Arc::new(MirroredFeed::new(source.key()));
        ledger
            .register_input(InputFeed::Mirrored(Arc::clone(&mirror)))
            .unwrap();
        mirror
    }

    #[test]
    fn test_xyz_scenario_orders_by_writer_then_index() {
        let (a, b) = ordered_writers();
        a.append(b"x".to_vec()).unwrap();
        a.append(b"y".to_vec()).unwrap();
        b.append(b"z".to_vec()).unwrap();

        let mut ledger = ledger();
        mirror_into(&mut ledger, &a);
        mirror_into(&mut ledger, &b);
        ledger.note_remote_head(&a.key(), &a.head()).unwrap();
        ledger.note_remote_head(&b.key(), &b.head()).unwrap();

        // Nothing merges until both are caught up.
        ledger.ingest(&b.key(), b.entry(0).unwrap()).unwrap();
        ledger.ingest(&a.key(), a.entry(0).unwrap()).unwrap();
        assert_eq!(ledger.output_len(), 0);
        ledger.ingest(&a.key(), a.entry(1).unwrap()).unwrap();

        assert_eq!(
            payloads(&ledger),
            vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()]
        );
        let first = ledger.record(0).unwrap();
        assert_eq!((first.writer, first.index), (a.key(), 0));
        assert_eq!(ledger.record(2).unwrap().writer, b.key());
    }

    #[test]
    fn test_get_beyond_output_is_out_of_range() {
        let ledger = ledger();
        assert_eq!(
            ledger.get(0),
            Err(LedgerError::OutOfRange {
                index: 0,
                length: 0
            })
        );
        assert_eq!(
            Ledger::new(LedgerConfig::default()).get(0),
            Err(LedgerError::NoOutput)
        );
    }

    #[test]
    fn test_replayed_delivery_merges_once() {
        let (a, _) = ordered_writers();
        a.append(b"one".to_vec()).unwrap();
        a.append(b"two".to_vec()).unwrap();

        let mut ledger = ledger();
        mirror_into(&mut ledger, &a);
        for _ in 0..3 {
            for i in 0..2 {
                ledger.ingest(&a.key(), a.entry(i).unwrap()).unwrap();
            }
        }
        ledger.merge_pass().unwrap();
        assert_eq!(payloads(&ledger), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_arrival_order_does_not_change_output() {
        let (a, b) = ordered_writers();
        let c = LocalFeed::create(None);
        for (feed, n) in [(&a, 3u8), (&b, 2), (&c, 4)] {
            for i in 0..n {
                feed.append(vec![i, n]).unwrap();
            }
        }
        let sources = [&a, &b, &c];

        let deliveries: Vec<(usize, u64)> = sources
            .iter()
            .enumerate()
            .flat_map(|(s, f)| (0..f.len()).map(move |i| (s, i)))
            .collect();
        let mut reversed = deliveries.clone();
        reversed.reverse();
        let mut interleaved = deliveries.clone();
        interleaved.sort_by_key(|(s, i)| (*i, std::cmp::Reverse(*s)));

        let mut outputs = Vec::new();
        for order in [deliveries, reversed, interleaved] {
            let mut ledger = ledger();
            for source in sources {
                mirror_into(&mut ledger, source);
                ledger
                    .note_remote_head(&source.key(), &source.head())
                    .unwrap();
            }
            for (s, i) in order {
                let source = sources[s];
                ledger.ingest(&source.key(), source.entry(i).unwrap()).unwrap();
            }
            let output = ledger.output().unwrap();
            outputs.push((0..output.len()).map(|i| output.get(i).unwrap()).collect::<Vec<_>>());
        }

        assert_eq!(outputs[0].len(), 9);
        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[0], outputs[2]);
    }

    #[test]
    fn test_gap_holds_merge_until_filled() {
        let (a, _) = ordered_writers();
        for i in 0..6u8 {
            a.append(vec![i]).unwrap();
        }
        let mut ledger = Ledger::new(LedgerConfig {
            require_caught_up: false,
            ..LedgerConfig::default()
        });
        ledger
            .set_local_output(Arc::new(LocalFeed::create(None)))
            .unwrap();
        mirror_into(&mut ledger, &a);

        for i in 0..3 {
            ledger.ingest(&a.key(), a.entry(i).unwrap()).unwrap();
        }
        assert_eq!(ledger.output_len(), 3);

        let outcome = ledger.ingest(&a.key(), a.entry(5).unwrap()).unwrap();
        assert_eq!(outcome, ReceiveOutcome::Buffered { next_missing: 3 });
        ledger.ingest(&a.key(), a.entry(4).unwrap()).unwrap();
        assert_eq!(ledger.output_len(), 3);
        assert_eq!(ledger.writer_state(&a.key()), WriterState::Syncing);

        ledger.ingest(&a.key(), a.entry(3).unwrap()).unwrap();
        assert_eq!(payloads(&ledger), (0..6u8).map(|i| vec![i]).collect::<Vec<_>>());
        assert_eq!(ledger.writer_state(&a.key()), WriterState::CaughtUp);
    }

    #[test]
    fn test_causal_dependency_overrides_key_order() {
        let (low, high) = ordered_writers();
        let low = Arc::new(low);
        let high = Arc::new(high);

        // The high writer's ledger sees "first" before the low writer
        // writes "second", so "second" depends on it.
        let mut writer_ledger = ledger();
        writer_ledger.set_local_input(Arc::clone(&low)).unwrap();
        let high_mirror = mirror_into(&mut writer_ledger, &high);
        high.append(b"first".to_vec()).unwrap();
        high_mirror.receive(high.entry(0).unwrap()).unwrap();
        writer_ledger.merge_pass().unwrap();
        writer_ledger.append_local(b"second".to_vec()).unwrap();
        assert_eq!(
            payloads(&writer_ledger),
            vec![b"first".to_vec(), b"second".to_vec()]
        );

        // An observer receiving both at once still honours the dependency,
        // even though the low writer sorts first.
        let mut observer = ledger();
        mirror_into(&mut observer, &low);
        mirror_into(&mut observer, &high);
        observer.note_remote_head(&low.key(), &low.head()).unwrap();
        observer.note_remote_head(&high.key(), &high.head()).unwrap();
        observer.ingest(&low.key(), low.entry(0).unwrap()).unwrap();
        assert_eq!(observer.output_len(), 0);
        observer.ingest(&high.key(), high.entry(0).unwrap()).unwrap();
        assert_eq!(
            payloads(&observer),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
    }

    #[test]
    fn test_dependency_on_unregistered_writer_blocks() {
        let (low, high) = ordered_writers();
        let high = Arc::new(high);
        let mut author = ledger();
        author.set_local_input(Arc::new(low)).unwrap();
        let mirror = mirror_into(&mut author, &high);
        high.append(b"dep".to_vec()).unwrap();
        mirror.receive(high.entry(0).unwrap()).unwrap();
        author.merge_pass().unwrap();
        author.append_local(b"needs dep".to_vec()).unwrap();
        let local = match author.input(&author.local_writer().unwrap()) {
            Some(InputFeed::Local(feed)) => Arc::clone(feed),
            _ => panic!("local input missing"),
        };

        let mut observer = ledger();
        mirror_into(&mut observer, &local);
        observer.ingest(&local.key(), local.entry(0).unwrap()).unwrap();
        assert_eq!(observer.output_len(), 0);
        assert_eq!(observer.unknown_writers(), vec![high.key()]);
    }

    #[test]
    fn test_corrupted_entry_isolates_only_that_writer() {
        let (a, b) = ordered_writers();
        a.append(b"a0".to_vec()).unwrap();
        a.append(b"a1".to_vec()).unwrap();
        b.append(b"b0".to_vec()).unwrap();

        let mut ledger = ledger();
        let mut events = ledger.subscribe();
        mirror_into(&mut ledger, &a);
        mirror_into(&mut ledger, &b);

        ledger.ingest(&a.key(), a.entry(0).unwrap()).unwrap();
        let mut bad = a.entry(1).unwrap();
        bad.payload = b"evil".to_vec();
        let result = ledger.ingest(&a.key(), bad);
        assert!(matches!(
            result,
            Err(LedgerError::Feed(FeedError::VerificationFailure { index: 1, .. }))
        ));
        assert_eq!(ledger.writer_state(&a.key()), WriterState::Diverged);

        // The other writer keeps merging.
        ledger.ingest(&b.key(), b.entry(0).unwrap()).unwrap();
        assert_eq!(payloads(&ledger), vec![b"a0".to_vec(), b"b0".to_vec()]);

        // Further entries from the isolated writer are refused.
        assert_eq!(
            ledger.ingest(&a.key(), a.entry(1).unwrap()),
            Err(LedgerError::WriterDiverged(a.key()))
        );

        let mut saw_divergence = false;
        while let Ok(event) = events.try_recv() {
            if let LedgerEvent::WriterDiverged { writer, .. } = event {
                assert_eq!(writer, a.key());
                saw_divergence = true;
            }
        }
        assert!(saw_divergence);

        // Resync from index 0 restores the writer.
        ledger.resync(&a.key()).unwrap();
        ledger.ingest(&a.key(), a.entry(0).unwrap()).unwrap();
        ledger.ingest(&a.key(), a.entry(1).unwrap()).unwrap();
        assert_eq!(
            payloads(&ledger),
            vec![b"a0".to_vec(), b"b0".to_vec(), b"a1".to_vec()]
        );
    }

    #[test]
    fn test_tampered_storage_is_not_merged() {
        let (a, _) = ordered_writers();
        for p in [b"ok0", b"ok1", b"ok2"] {
            a.append(p.to_vec()).unwrap();
        }
        let storage = MemoryStorage::new();
        for i in 0..3 {
            let mut entry = a.entry(i).unwrap();
            if i == 1 {
                entry.payload = b"tampered".to_vec();
            }
            storage.append(&entry, &a.head()).unwrap();
        }
        let mirror = Arc::new(MirroredFeed::open(a.key(), Arc::new(storage)).unwrap());
        assert_eq!(mirror.audit().first_invalid_index, Some(1));

        let mut ledger = ledger();
        ledger
            .register_input(InputFeed::Mirrored(Arc::clone(&mirror)))
            .unwrap();
        assert_eq!(payloads(&ledger), vec![b"ok0".to_vec()]);
        assert_eq!(ledger.writer_state(&a.key()), WriterState::Diverged);

        let status = ledger.verify_writers();
        let report = &status[&a.key()];
        assert_eq!(report.audit.first_invalid_index, Some(1));
        assert_eq!(report.merged, 1);
    }

    #[test]
    fn test_contradicting_head_isolates_writer() {
        let keypair = FeedKeypair::generate();
        let honest = LocalFeed::create(Some(keypair.clone()));
        honest.append(b"a".to_vec()).unwrap();
        let fork = LocalFeed::create(Some(keypair));
        fork.append(b"A".to_vec()).unwrap();

        let mut ledger = ledger();
        mirror_into(&mut ledger, &honest);
        ledger.ingest(&honest.key(), honest.entry(0).unwrap()).unwrap();

        assert!(matches!(
            ledger.note_remote_head(&honest.key(), &fork.head()),
            Err(LedgerError::Feed(FeedError::Divergence { index: 0 }))
        ));
        assert_eq!(ledger.writer_state(&honest.key()), WriterState::Diverged);

        // A resync that refills the forked history is caught at the merge
        // boundary and isolated again.
        fork.append(b"B".to_vec()).unwrap();
        ledger.resync(&honest.key()).unwrap();
        ledger.ingest(&honest.key(), fork.entry(0).unwrap()).unwrap();
        ledger.ingest(&honest.key(), fork.entry(1).unwrap()).unwrap();
        assert_eq!(ledger.writer_state(&honest.key()), WriterState::Diverged);
        assert_eq!(payloads(&ledger), vec![b"a".to_vec()]);
    }

    #[test]
    fn test_restart_restores_frontier() {
        let (a, _) = ordered_writers();
        let output = Arc::new(LocalFeed::create(None));
        a.append(b"first".to_vec()).unwrap();

        {
            let mut ledger = Ledger::new(LedgerConfig::default());
            ledger.set_local_output(Arc::clone(&output)).unwrap();
            mirror_into(&mut ledger, &a);
            ledger.ingest(&a.key(), a.entry(0).unwrap()).unwrap();
            assert_eq!(ledger.output_len(), 1);
        }

        a.append(b"second".to_vec()).unwrap();
        let mut ledger = Ledger::new(LedgerConfig::default());
        let mirror = mirror_into(&mut ledger, &a);
        mirror.receive(a.entry(0).unwrap()).unwrap();
        mirror.receive(a.entry(1).unwrap()).unwrap();
        ledger.set_local_output(output).unwrap();

        assert_eq!(payloads(&ledger), vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(ledger.frontier_clock().get(&a.key()), 2);
    }

    #[test]
    fn test_local_appends_merge_and_close() {
        let mut ledger = ledger();
        assert_eq!(ledger.append_local(b"x".to_vec()), Err(LedgerError::NoLocalInput));

        ledger
            .set_local_input(Arc::new(LocalFeed::create(None)))
            .unwrap();
        assert_eq!(ledger.append_local(b"x".to_vec()).unwrap(), 0);
        assert_eq!(ledger.append_local(b"y".to_vec()).unwrap(), 1);
        assert_eq!(payloads(&ledger), vec![b"x".to_vec(), b"y".to_vec()]);

        let status = ledger.verify_writers();
        let local = status.values().next().unwrap();
        assert!(local.local);
        assert_eq!(local.state, WriterState::CaughtUp);
        assert!(local.audit.is_valid());

        ledger.close().unwrap();
        ledger.close().unwrap();
        assert_eq!(ledger.append_local(b"z".to_vec()), Err(LedgerError::Closed));
        assert_eq!(ledger.get(1).unwrap(), b"y");
    }

    #[test]
    fn test_syncing_writer_does_not_hold_local_appends() {
        let (remote, _) = ordered_writers();
        for i in 0..3u8 {
            remote.append(vec![i]).unwrap();
        }
        let mut ledger = ledger();
        ledger
            .set_local_input(Arc::new(LocalFeed::create(None)))
            .unwrap();
        mirror_into(&mut ledger, &remote);
        // Announced, never delivered.
        ledger.note_remote_head(&remote.key(), &remote.head()).unwrap();
        assert_eq!(ledger.writer_state(&remote.key()), WriterState::Syncing);

        ledger.append_local(b"mine".to_vec()).unwrap();
        ledger.append_local(b"also mine".to_vec()).unwrap();
        assert_eq!(ledger.output_len(), 2);
        assert_eq!(ledger.get(0).unwrap(), b"mine");
    }

    #[test]
    fn test_stalled_writer_stops_holding_others() {
        let (stuck, steady) = ordered_writers();
        stuck.append(b"s0".to_vec()).unwrap();
        stuck.append(b"s1".to_vec()).unwrap();
        steady.append(b"t0".to_vec()).unwrap();

        let mut ledger = Ledger::new(LedgerConfig {
            stall_timeout_ms: 1_000,
            ..LedgerConfig::default()
        });
        ledger
            .set_local_output(Arc::new(LocalFeed::create(None)))
            .unwrap();
        let mut events = ledger.subscribe();
        mirror_into(&mut ledger, &stuck);
        mirror_into(&mut ledger, &steady);
        ledger.note_remote_head(&stuck.key(), &stuck.head()).unwrap();
        ledger.ingest(&steady.key(), steady.entry(0).unwrap()).unwrap();
        assert_eq!(ledger.output_len(), 0);

        // Not yet past the timeout.
        assert!(ledger.expire_stalled(Utc::now()).unwrap().is_empty());
        assert_eq!(ledger.output_len(), 0);

        let later = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(ledger.expire_stalled(later).unwrap(), vec![stuck.key()]);
        assert_eq!(ledger.writer_state(&stuck.key()), WriterState::Stalled);
        assert_eq!(payloads(&ledger), vec![b"t0".to_vec()]);

        let mut saw_stall = false;
        while let Ok(event) = events.try_recv() {
            if let LedgerEvent::WriterStalled { writer, held, known } = event {
                assert_eq!((writer, held, known), (stuck.key(), 0, 2));
                saw_stall = true;
            }
        }
        assert!(saw_stall);

        // Re-announcing does not bring the barrier back.
        ledger.note_remote_head(&stuck.key(), &stuck.head()).unwrap();
        assert_eq!(ledger.writer_state(&stuck.key()), WriterState::Stalled);
        steady.append(b"t1".to_vec()).unwrap();
        ledger.ingest(&steady.key(), steady.entry(1).unwrap()).unwrap();
        assert_eq!(ledger.output_len(), 2);

        // Late entries still merge, and the writer is caught up again.
        ledger.ingest(&stuck.key(), stuck.entry(0).unwrap()).unwrap();
        ledger.ingest(&stuck.key(), stuck.entry(1).unwrap()).unwrap();
        assert_eq!(ledger.writer_state(&stuck.key()), WriterState::CaughtUp);
        assert_eq!(
            payloads(&ledger),
            vec![b"t0".to_vec(), b"t1".to_vec(), b"s0".to_vec(), b"s1".to_vec()]
        );
    }

    #[test]
    fn test_zero_stall_timeout_waits_forever() {
        let (remote, _) = ordered_writers();
        remote.append(b"r".to_vec()).unwrap();
        let mut ledger = Ledger::new(LedgerConfig {
            stall_timeout_ms: 0,
            ..LedgerConfig::default()
        });
        ledger
            .set_local_output(Arc::new(LocalFeed::create(None)))
            .unwrap();
        mirror_into(&mut ledger, &remote);
        ledger.note_remote_head(&remote.key(), &remote.head()).unwrap();

        let much_later = Utc::now() + chrono::Duration::days(1);
        assert!(ledger.expire_stalled(much_later).unwrap().is_empty());
        assert_eq!(ledger.writer_state(&remote.key()), WriterState::Syncing);
    }
}
