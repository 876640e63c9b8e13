//! In-process fabric simulator
//!
//! A shared rendezvous where simulated nodes join topics and get connected
//! to each other through channel-backed streams. Used by tests in place of
//! real sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use super::topic::{DiscoveryKey, JoinOptions};
use super::transport::{Discovery, DiscoveryEvent, PeerConnection};
use super::{FabricError, PeerId};

const EVENT_QUEUE: usize = 64;
const LINK_QUEUE: usize = 256;

struct SimPeer {
    events: mpsc::Sender<DiscoveryEvent>,
    latency: Duration,
}

type LinkKey = (PeerId, PeerId, DiscoveryKey);

#[derive(Default)]
struct SimState {
    peers: HashMap<PeerId, SimPeer>,
    topics: HashMap<DiscoveryKey, HashMap<PeerId, JoinOptions>>,
    links: HashMap<LinkKey, Arc<SimLink>>,
}

/// The shared medium all simulated nodes connect through.
pub struct SimNetwork {
    state: StdMutex<SimState>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: StdMutex::new(SimState::default()),
        })
    }

    /// Add a node with zero link latency.
    pub fn create_node(self: &Arc<Self>, name: &str) -> SimNode {
        self.create_node_with_latency(name, Duration::ZERO)
    }

    /// Add a node whose sends each take `latency` of (tokio) time.
    pub fn create_node_with_latency(self: &Arc<Self>, name: &str, latency: Duration) -> SimNode {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let id = PeerId::new(name);
        if let Ok(mut state) = self.state.lock() {
            state.peers.insert(
                id.clone(),
                SimPeer {
                    events: events_tx,
                    latency,
                },
            );
        }
        SimNode {
            id,
            network: Arc::clone(self),
            events_rx: Mutex::new(events_rx),
        }
    }

    /// Break every stream between two nodes without telling either reader.
    ///
    /// Subsequent sends fail; blocked receives stay blocked. Models a stream
    /// that died mid-flight.
    pub fn break_link(&self, a: &PeerId, b: &PeerId) {
        if let Ok(state) = self.state.lock() {
            for ((x, y, _), link) in state.links.iter() {
                if (x == a && y == b) || (x == b && y == a) {
                    link.open.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    fn link_key(a: &PeerId, b: &PeerId, key: DiscoveryKey) -> LinkKey {
        if a <= b {
            (a.clone(), b.clone(), key)
        } else {
            (b.clone(), a.clone(), key)
        }
    }

    /// Record `node` on `key` and create the links it implies.
    fn join(
        &self,
        node: &PeerId,
        key: DiscoveryKey,
        options: JoinOptions,
    ) -> Result<Vec<(mpsc::Sender<DiscoveryEvent>, DiscoveryEvent)>, FabricError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| FabricError::Discovery(e.to_string()))?;
        let state = &mut *state;

        let me = state.peers.get(node).ok_or(FabricError::Closed)?;
        let my_events = me.events.clone();
        let my_latency = me.latency;

        let members = state.topics.entry(key).or_default();
        members.insert(node.clone(), options);

        let mut deliveries = Vec::new();
        for (other, other_opts) in members.iter() {
            if other == node {
                continue;
            }
            let wanted = (options.discover && other_opts.announce)
                || (options.announce && other_opts.discover);
            if !wanted {
                continue;
            }
            let link_key = Self::link_key(node, other, key);
            if let Some(link) = state.links.get(&link_key) {
                if link.open.load(Ordering::SeqCst) {
                    continue;
                }
            }
            let Some(peer) = state.peers.get(other) else {
                continue;
            };

            let (mine, theirs, link) =
                SimConnection::create_pair(node.clone(), other.clone(), my_latency, peer.latency);
            state.links.insert(link_key, link);
            deliveries.push((
                my_events.clone(),
                DiscoveryEvent::Connected {
                    key,
                    connection: Box::new(mine),
                },
            ));
            deliveries.push((
                peer.events.clone(),
                DiscoveryEvent::Connected {
                    key,
                    connection: Box::new(theirs),
                },
            ));
        }
        Ok(deliveries)
    }

    fn leave(&self, node: &PeerId, key: &DiscoveryKey) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(members) = state.topics.get_mut(key) {
                members.remove(node);
            }
        }
    }

    fn remove_node(&self, node: &PeerId) {
        if let Ok(mut state) = self.state.lock() {
            state.peers.remove(node);
            for members in state.topics.values_mut() {
                members.remove(node);
            }
        }
    }
}

/// One simulated process on a [`SimNetwork`].
pub struct SimNode {
    id: PeerId,
    network: Arc<SimNetwork>,
    events_rx: Mutex<mpsc::Receiver<DiscoveryEvent>>,
}

impl SimNode {
    /// The id other nodes see this node as.
    pub fn id(&self) -> &PeerId {
        &self.id
    }
}

#[async_trait]
impl Discovery for SimNode {
    async fn join(&self, key: DiscoveryKey, options: JoinOptions) -> Result<(), FabricError> {
        let deliveries = self.network.join(&self.id, key, options)?;
        for (target, event) in deliveries {
            // A receiver that has gone away has shut down; nothing to do.
            let _ = target.send(event).await;
        }
        Ok(())
    }

    async fn leave(&self, key: &DiscoveryKey) -> Result<(), FabricError> {
        self.network.leave(&self.id, key);
        Ok(())
    }

    async fn next_event(&self) -> Option<DiscoveryEvent> {
        let mut rx = self.events_rx.lock().await;
        rx.recv().await
    }

    async fn shutdown(&self) -> Result<(), FabricError> {
        self.network.remove_node(&self.id);
        Ok(())
    }
}

/// State shared by both halves of a simulated stream.
struct SimLink {
    open: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

/// One half of a simulated stream.
pub struct SimConnection {
    peer_id: PeerId,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    link: Arc<SimLink>,
    latency: Duration,
}

impl SimConnection {
    fn create_pair(
        a: PeerId,
        b: PeerId,
        latency_a: Duration,
        latency_b: Duration,
    ) -> (SimConnection, SimConnection, Arc<SimLink>) {
        let (tx_ab, rx_ab) = mpsc::channel(LINK_QUEUE);
        let (tx_ba, rx_ba) = mpsc::channel(LINK_QUEUE);
        let (closed_tx, _) = watch::channel(false);
        let link = Arc::new(SimLink {
            open: AtomicBool::new(true),
            closed_tx,
        });

        let conn_a = SimConnection {
            peer_id: b,
            tx: tx_ab,
            rx: Mutex::new(rx_ba),
            link: Arc::clone(&link),
            latency: latency_a,
        };
        let conn_b = SimConnection {
            peer_id: a,
            tx: tx_ba,
            rx: Mutex::new(rx_ab),
            link: Arc::clone(&link),
            latency: latency_b,
        };
        (conn_a, conn_b, link)
    }

    fn closed_error(&self) -> FabricError {
        FabricError::ConnectionClosed(self.peer_id.clone())
    }
}

#[async_trait]
impl PeerConnection for SimConnection {
    async fn send(&self, data: &[u8]) -> Result<(), FabricError> {
        if !self.is_connected() {
            return Err(self.closed_error());
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.tx
            .send(data.to_vec())
            .await
            .map_err(|_| self.closed_error())
    }

    async fn recv(&self) -> Result<Vec<u8>, FabricError> {
        let mut closed = self.link.closed_tx.subscribe();
        if *closed.borrow() {
            return Err(self.closed_error());
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            message = rx.recv() => message.ok_or_else(|| self.closed_error()),
            _ = closed.changed() => Err(self.closed_error()),
        }
    }

    async fn close(&self) -> Result<(), FabricError> {
        self.link.open.store(false, Ordering::SeqCst);
        self.link.closed_tx.send_replace(true);
        Ok(())
    }

    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn is_connected(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }
}
