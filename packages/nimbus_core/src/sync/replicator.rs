//! Replicator: drives a ledger from fabric traffic
//!
//! One event loop per replicator consumes [`FabricEvent`]s. The ledger lock
//! is taken to decide what to do and released before anything is sent, so a
//! slow peer never blocks local appends or merge passes. The same loop
//! periodically releases writers that peers announced but never served.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::MissedTickBehavior;

use crate::config::SyncConfig;
use crate::fabric::{FabricEvent, PeerFabric, PeerId};
use crate::feed::{Feed, FeedError, FeedPublicKey, FeedRegistry, MirroredFeed};
use crate::ledger::{InputFeed, Ledger, LedgerError, WriterState};

use super::{SyncError, SyncMessage};

pub struct Replicator {
    ledger: Arc<Mutex<Ledger>>,
    fabric: Arc<PeerFabric>,
    /// Where mirrors of newly announced writers are opened, if persistent.
    registry: Option<Arc<FeedRegistry>>,
    config: SyncConfig,
    /// How often to look for stalled writers, if the ledger bounds syncing.
    stall_sweep: Option<Duration>,
    /// Peers that sent entries or heads failing verification.
    flagged: StdMutex<HashSet<PeerId>>,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl Replicator {
    /// Take over `ledger` and start replicating it over `fabric`.
    ///
    /// Subscribes to the fabric immediately, so create the replicator
    /// before joining topics. Must be called inside a tokio runtime.
    pub fn new(ledger: Ledger, fabric: Arc<PeerFabric>, config: SyncConfig) -> Arc<Self> {
        Self::build(ledger, fabric, None, config)
    }

    /// Like [`Replicator::new`], opening mirrors through `registry` so they
    /// persist with the rest of the store.
    pub fn with_registry(
        ledger: Ledger,
        fabric: Arc<PeerFabric>,
        registry: Arc<FeedRegistry>,
        config: SyncConfig,
    ) -> Arc<Self> {
        Self::build(ledger, fabric, Some(registry), config)
    }

    fn build(
        ledger: Ledger,
        fabric: Arc<PeerFabric>,
        registry: Option<Arc<FeedRegistry>>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let stall_sweep = ledger
            .stall_timeout()
            .map(|timeout| (timeout / 4).max(Duration::from_millis(10)));
        let replicator = Arc::new(Self {
            ledger: Arc::new(Mutex::new(ledger)),
            fabric,
            registry,
            config,
            stall_sweep,
            flagged: StdMutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            shutdown_tx,
        });
        replicator.start_processing();
        replicator
    }

    pub fn ledger(&self) -> &Arc<Mutex<Ledger>> {
        &self.ledger
    }

    pub fn fabric(&self) -> &Arc<PeerFabric> {
        &self.fabric
    }

    /// Peers caught sending data that failed verification, sorted.
    pub fn flagged_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = match self.flagged.lock() {
            Ok(flagged) => flagged.iter().cloned().collect(),
            Err(_) => Vec::new(),
        };
        peers.sort();
        peers
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn start_processing(self: &Arc<Self>) {
        let mut events = self.fabric.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        let sweeping = self.stall_sweep.is_some();
        let mut sweep =
            tokio::time::interval(self.stall_sweep.unwrap_or(Duration::from_secs(3600)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    result = events.recv() => result,
                    _ = sweep.tick(), if sweeping => {
                        let Some(replicator) = weak.upgrade() else { break };
                        replicator.release_stalled().await;
                        continue;
                    }
                    _ = shutdown.recv() => break,
                };
                let Some(replicator) = weak.upgrade() else { break };
                match result {
                    Ok(event) => replicator.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("Replicator missed {} fabric events, re-announcing", missed);
                        replicator.announce(None).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            log::debug!("Replicator event loop stopped");
        });
    }

    async fn release_stalled(&self) {
        let mut ledger = self.ledger.lock().await;
        if ledger.is_closed() {
            return;
        }
        match ledger.expire_stalled(Utc::now()) {
            Ok(released) if !released.is_empty() => {
                log::info!("Released {} stalled writers", released.len());
            }
            Ok(_) => {}
            Err(e) => log::warn!("Stall sweep failed: {}", e),
        }
    }

    async fn handle_event(&self, event: FabricEvent) {
        match event {
            FabricEvent::Connected { peer, .. } => {
                self.ledger.lock().await.peer_connected(peer.clone());
                self.announce(Some(&peer)).await;
            }
            FabricEvent::Data { peer, data } => match SyncMessage::from_cbor(&data) {
                Ok(message) => {
                    if let Err(e) = self.handle_message(&peer, message).await {
                        log::warn!("Handling message from {} failed: {}", peer, e);
                    }
                }
                Err(e) => log::warn!("Dropping undecodable message from {}: {}", peer, e),
            },
            FabricEvent::Disconnected { peer } => {
                self.ledger.lock().await.peer_disconnected(peer);
            }
            FabricEvent::DiscoveryFailed { key, reason } => match key {
                Some(key) => log::warn!("Discovery on {} failed: {}", key.short(), reason),
                None => log::warn!("Discovery failed: {}", reason),
            },
        }
    }

    async fn handle_message(&self, peer: &PeerId, message: SyncMessage) -> Result<(), SyncError> {
        match message {
            SyncMessage::Have { writer, head } => {
                let request = {
                    let mut ledger = self.ledger.lock().await;
                    if !self.ensure_writer(&mut ledger, &writer)? {
                        return Ok(());
                    }
                    match ledger.note_remote_head(&writer, &head) {
                        Ok(()) => {}
                        Err(LedgerError::WriterDiverged(_)) => return Ok(()),
                        Err(LedgerError::Feed(FeedError::Divergence { .. })) => {
                            self.flag(peer, &writer, "announced a contradicting head");
                            return Ok(());
                        }
                        Err(e) => return Err(e.into()),
                    }
                    self.next_request(&ledger, &writer)
                };
                if let Some(request) = request {
                    self.deliver(Some(peer), &request).await;
                }
            }

            SyncMessage::Request { writer, from, to } => {
                let entries = {
                    let ledger = self.ledger.lock().await;
                    if ledger.writer_state(&writer) == WriterState::Diverged {
                        return Ok(());
                    }
                    let Some(input) = ledger.input(&writer) else {
                        return Ok(());
                    };
                    let feed = input.feed();
                    let end = to
                        .min(feed.len())
                        .min(from.saturating_add(self.config.max_batch));
                    (from..end)
                        .map(|i| feed.entry(i))
                        .collect::<Result<Vec<_>, _>>()?
                };
                if !entries.is_empty() {
                    log::debug!(
                        "Serving {} entries of {} to {}",
                        entries.len(),
                        writer.short(),
                        peer
                    );
                    self.deliver(Some(peer), &SyncMessage::Entries { writer, entries })
                        .await;
                }
            }

            SyncMessage::Entries { writer, entries } => {
                let (request, progress) = {
                    let mut ledger = self.ledger.lock().await;
                    if !self.ensure_writer(&mut ledger, &writer)? {
                        return Ok(());
                    }
                    let before = self.held_length(&ledger, &writer);
                    for entry in entries {
                        match ledger.ingest(&writer, entry) {
                            Ok(_) => {}
                            Err(LedgerError::WriterDiverged(_)) | Err(LedgerError::NotMirrored(_)) => {
                                break
                            }
                            Err(LedgerError::Feed(
                                FeedError::VerificationFailure { .. } | FeedError::Divergence { .. },
                            )) => {
                                self.flag(peer, &writer, "sent an entry that failed verification");
                                break;
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }

                    let progress = ledger
                        .input(&writer)
                        .map(|input| input.feed().head())
                        .filter(|head| head.length > before)
                        .map(|head| SyncMessage::Have { writer, head });
                    (self.next_request(&ledger, &writer), progress)
                };

                if let Some(request) = request {
                    self.deliver(Some(peer), &request).await;
                }
                if let Some(have) = progress {
                    self.deliver(None, &have).await;
                }
            }
        }
        Ok(())
    }

    /// Make sure `writer` is an input, registering a mirror if allowed.
    fn ensure_writer(&self, ledger: &mut Ledger, writer: &FeedPublicKey) -> Result<bool, SyncError> {
        if ledger.input(writer).is_some() {
            return Ok(true);
        }
        if !self.config.auto_register {
            log::debug!("Ignoring unregistered writer {}", writer.short());
            return Ok(false);
        }
        let mirror = match &self.registry {
            Some(registry) => registry.open_mirror(*writer)?,
            None => Arc::new(MirroredFeed::new(*writer)),
        };
        ledger.register_input(InputFeed::Mirrored(mirror))?;
        Ok(true)
    }

    fn held_length(&self, ledger: &Ledger, writer: &FeedPublicKey) -> u64 {
        ledger.input(writer).map(|i| i.feed().len()).unwrap_or(0)
    }

    /// The next range to ask for, capped at one batch.
    fn next_request(&self, ledger: &Ledger, writer: &FeedPublicKey) -> Option<SyncMessage> {
        if ledger.writer_state(writer) == WriterState::Diverged {
            return None;
        }
        let Some(InputFeed::Mirrored(mirror)) = ledger.input(writer) else {
            return None;
        };
        let missing = mirror.missing()?;
        Some(SyncMessage::Request {
            writer: *writer,
            from: missing.start,
            to: missing
                .end
                .min(missing.start.saturating_add(self.config.max_batch)),
        })
    }

    fn flag(&self, peer: &PeerId, writer: &FeedPublicKey, what: &str) {
        log::warn!("Peer {} {} for writer {}", peer, what, writer.short());
        if let Ok(mut flagged) = self.flagged.lock() {
            flagged.insert(peer.clone());
        }
    }

    /// Announce the head of every healthy, non-empty input to one peer, or
    /// to everyone.
    async fn announce(&self, target: Option<&PeerId>) {
        let heads: Vec<SyncMessage> = {
            let ledger = self.ledger.lock().await;
            ledger
                .writers()
                .into_iter()
                .filter(|w| ledger.writer_state(w) != WriterState::Diverged)
                .filter_map(|writer| {
                    let head = ledger.input(&writer)?.feed().head();
                    (head.length > 0).then_some(SyncMessage::Have { writer, head })
                })
                .collect()
        };
        for have in &heads {
            self.deliver(target, have).await;
        }
    }

    /// Send without holding the ledger. Failures are per-peer and only
    /// logged; the fabric drops peers whose streams are gone.
    async fn deliver(&self, target: Option<&PeerId>, message: &SyncMessage) {
        let bytes = match message.to_cbor() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode sync message: {}", e);
                return;
            }
        };
        match target {
            Some(peer) => {
                if let Err(e) = self.fabric.send(peer, &bytes).await {
                    log::debug!("Send to {} failed: {}", peer, e);
                }
            }
            None => match self.fabric.broadcast(&bytes).await {
                Ok(report) if !report.all_delivered() => {
                    log::debug!("Broadcast reached {} peers, {} failed",
                        report.delivered.len(), report.failed.len());
                }
                Ok(_) => {}
                Err(e) => log::debug!("Broadcast failed: {}", e),
            },
        }
    }

    /// Append through the ledger and push the new entry to every peer.
    pub async fn append_local(&self, payload: impl Into<Vec<u8>>) -> Result<u64, SyncError> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        let (index, push) = {
            let mut ledger = self.ledger.lock().await;
            let index = ledger.append_local(payload)?;
            let writer = ledger.local_writer().ok_or(LedgerError::NoLocalInput)?;
            let input = ledger.input(&writer).ok_or(LedgerError::NoLocalInput)?;
            let entry = input.feed().entry(index)?;
            (
                index,
                SyncMessage::Entries {
                    writer,
                    entries: vec![entry],
                },
            )
        };
        self.deliver(None, &push).await;
        Ok(index)
    }

    /// Stop replicating, close the fabric and then the ledger. Idempotent.
    ///
    /// An append already holding the ledger finishes before the ledger
    /// closes.
    pub async fn close(&self) -> Result<(), SyncError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(());
        self.fabric.close().await?;
        self.ledger.lock().await.close()?;
        log::info!("Replicator closed");
        Ok(())
    }
}
