//! PeerFabric: connection owner and message fan-out
//!
//! Accepts connected streams from a [`Discovery`] implementation, keeps one
//! stream per peer, runs a receive loop per stream and publishes connection
//! lifecycle and inbound data as [`FabricEvent`]s.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use futures_util::future::join_all;
use tokio::sync::{broadcast, RwLock};

use super::topic::{DiscoveryKey, DiscoveryTopic, JoinOptions};
use super::transport::{Discovery, DiscoveryEvent, PeerConnection};
use super::{FabricError, PeerId};

/// Everything observable about the fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricEvent {
    Connected { peer: PeerId, key: DiscoveryKey },
    Data { peer: PeerId, data: Vec<u8> },
    Disconnected { peer: PeerId },
    /// Reported once per failure; the fabric does not retry.
    DiscoveryFailed {
        key: Option<DiscoveryKey>,
        reason: String,
    },
}

/// Outcome of [`PeerFabric::broadcast`].
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<PeerId>,
    pub failed: Vec<(PeerId, FabricError)>,
}

impl BroadcastReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

type ConnectionCallback = Box<dyn Fn(&PeerId, &DiscoveryKey) + Send + Sync>;

struct PeerLink {
    connection: Arc<dyn PeerConnection>,
    topics: HashSet<DiscoveryKey>,
}

/// Topic-scoped swarm of peer connections.
pub struct PeerFabric {
    discovery: Arc<dyn Discovery>,
    topics: RwLock<HashMap<DiscoveryKey, JoinOptions>>,
    /// Active connections keyed by peer id.
    connections: RwLock<HashMap<PeerId, PeerLink>>,
    events_tx: broadcast::Sender<FabricEvent>,
    callbacks: StdMutex<Vec<ConnectionCallback>>,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl PeerFabric {
    /// Create a fabric over `discovery` and start accepting its connections.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(discovery: Arc<dyn Discovery>, event_capacity: usize) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(event_capacity.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);
        let fabric = Arc::new(Self {
            discovery,
            topics: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            events_tx,
            callbacks: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            shutdown_tx,
        });
        fabric.start_accepting();
        fabric
    }

    fn start_accepting(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let discovery = Arc::clone(&self.discovery);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = discovery.next_event() => event,
                    _ = shutdown.recv() => break,
                };
                let Some(event) = event else { break };
                let Some(fabric) = weak.upgrade() else { break };
                match event {
                    DiscoveryEvent::Connected { key, connection } => {
                        fabric.add_connection(key, Arc::from(connection)).await;
                    }
                    DiscoveryEvent::Failed { key, error } => {
                        log::warn!("Discovery failed: {}", error);
                        let _ = fabric.events_tx.send(FabricEvent::DiscoveryFailed {
                            key,
                            reason: error.to_string(),
                        });
                    }
                }
            }
        });
    }

    /// Join a topic. Joining again with the same options is a no-op.
    pub async fn join(
        &self,
        topic: &DiscoveryTopic,
        options: JoinOptions,
    ) -> Result<DiscoveryKey, FabricError> {
        if self.is_closed() {
            return Err(FabricError::Closed);
        }
        let key = topic.key();
        {
            let topics = self.topics.read().await;
            if topics.get(&key) == Some(&options) {
                return Ok(key);
            }
        }
        self.discovery.join(key, options).await?;
        self.topics.write().await.insert(key, options);
        log::info!("Joined topic {}", key.short());
        Ok(key)
    }

    /// Leave a topic, closing connections that served only that topic.
    pub async fn leave(&self, topic: &DiscoveryTopic) -> Result<(), FabricError> {
        let key = topic.key();
        if self.topics.write().await.remove(&key).is_none() {
            return Ok(());
        }
        self.discovery.leave(&key).await?;

        let orphaned: Vec<(PeerId, Arc<dyn PeerConnection>)> = {
            let mut conns = self.connections.write().await;
            for link in conns.values_mut() {
                link.topics.remove(&key);
            }
            let ids: Vec<PeerId> = conns
                .iter()
                .filter(|(_, link)| link.topics.is_empty())
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| conns.remove(&id).map(|link| (id, link.connection)))
                .collect()
        };
        for (peer, connection) in orphaned {
            let _ = connection.close().await;
            let _ = self.events_tx.send(FabricEvent::Disconnected { peer });
        }
        log::info!("Left topic {}", key.short());
        Ok(())
    }

    /// Register a callback fired once per new connection, in connection
    /// order. Messages go through [`PeerFabric::send`].
    pub fn on_connection<F>(&self, callback: F)
    where
        F: Fn(&PeerId, &DiscoveryKey) + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(Box::new(callback));
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FabricEvent> {
        self.events_tx.subscribe()
    }

    /// Send to one peer.
    ///
    /// A send failing because the stream is gone drops that peer.
    pub async fn send(&self, peer: &PeerId, data: &[u8]) -> Result<(), FabricError> {
        let connection = {
            let conns = self.connections.read().await;
            conns.get(peer).map(|link| Arc::clone(&link.connection))
        };
        let connection = connection.ok_or_else(|| FabricError::PeerNotFound(peer.clone()))?;
        let result = connection.send(data).await;
        if let Err(FabricError::ConnectionClosed(_)) = &result {
            self.remove_connection(peer).await;
        }
        result
    }

    /// Send to every connected peer concurrently.
    ///
    /// One peer failing does not affect delivery to the others; failures
    /// are listed in the report and those peers are dropped.
    pub async fn broadcast(&self, data: &[u8]) -> Result<BroadcastReport, FabricError> {
        if self.is_closed() {
            return Err(FabricError::Closed);
        }
        let targets: Vec<(PeerId, Arc<dyn PeerConnection>)> = {
            let conns = self.connections.read().await;
            conns
                .iter()
                .map(|(id, link)| (id.clone(), Arc::clone(&link.connection)))
                .collect()
        };

        let results = join_all(targets.into_iter().map(|(peer, connection)| async move {
            let result = connection.send(data).await;
            (peer, result)
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (peer, result) in results {
            match result {
                Ok(()) => report.delivered.push(peer),
                Err(e) => {
                    log::warn!("Broadcast to {} failed: {}", peer, e);
                    if matches!(e, FabricError::ConnectionClosed(_)) {
                        self.remove_connection(&peer).await;
                    }
                    report.failed.push((peer, e));
                }
            }
        }
        report.delivered.sort();
        Ok(report)
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.connections.read().await.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn peer_count(&self) -> usize {
        match self.connections.try_read() {
            Ok(conns) => conns.len(),
            Err(_) => 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Leave every topic and close every connection. Idempotent.
    pub async fn close(&self) -> Result<(), FabricError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(());
        self.topics.write().await.clear();
        if let Err(e) = self.discovery.shutdown().await {
            log::warn!("Discovery shutdown failed: {}", e);
        }

        let links: Vec<(PeerId, PeerLink)> = self.connections.write().await.drain().collect();
        for (peer, link) in links {
            let _ = link.connection.close().await;
            let _ = self.events_tx.send(FabricEvent::Disconnected { peer });
        }
        log::info!("Fabric closed");
        Ok(())
    }

    /// Take ownership of a newly connected stream and start its receive loop.
    async fn add_connection(self: &Arc<Self>, key: DiscoveryKey, connection: Arc<dyn PeerConnection>) {
        if self.is_closed() {
            let _ = connection.close().await;
            return;
        }
        let peer = connection.peer_id().clone();
        {
            let mut conns = self.connections.write().await;
            if let Some(existing) = conns.get_mut(&peer) {
                if existing.connection.is_connected() {
                    // Already talking to this peer; the topic rides along.
                    existing.topics.insert(key);
                    drop(conns);
                    let _ = connection.close().await;
                    return;
                }
            }
            conns.insert(
                peer.clone(),
                PeerLink {
                    connection: Arc::clone(&connection),
                    topics: HashSet::from([key]),
                },
            );
        }

        log::info!("Peer {} connected on topic {}", peer, key.short());
        if let Ok(callbacks) = self.callbacks.lock() {
            for callback in callbacks.iter() {
                callback(&peer, &key);
            }
        }
        let _ = self.events_tx.send(FabricEvent::Connected {
            peer: peer.clone(),
            key,
        });

        let fabric = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match connection.recv().await {
                    Ok(data) => {
                        let _ = fabric.events_tx.send(FabricEvent::Data {
                            peer: peer.clone(),
                            data,
                        });
                    }
                    Err(e) => {
                        log::debug!("Receive loop for {} ended: {}", peer, e);
                        fabric.remove_stream(&peer, &connection).await;
                        break;
                    }
                }
            }
        });
    }

    /// Drop a peer, whatever stream it is on.
    async fn remove_connection(&self, peer: &PeerId) {
        let removed = self.connections.write().await.remove(peer);
        if let Some(link) = removed {
            let _ = link.connection.close().await;
            log::info!("Peer {} disconnected", peer);
            let _ = self.events_tx.send(FabricEvent::Disconnected { peer: peer.clone() });
        }
    }

    /// Drop a peer only if it is still on `stream`.
    async fn remove_stream(&self, peer: &PeerId, stream: &Arc<dyn PeerConnection>) {
        let removed = {
            let mut conns = self.connections.write().await;
            match conns.get(peer) {
                Some(link) if Arc::ptr_eq(&link.connection, stream) => conns.remove(peer),
                _ => None,
            }
        };
        if removed.is_some() {
            log::info!("Peer {} disconnected", peer);
            let _ = self.events_tx.send(FabricEvent::Disconnected { peer: peer.clone() });
        }
    }
}
