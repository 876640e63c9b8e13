//! TCP transport
//!
//! Announcing binds `listen_addr` and accepts peers; discovering dials each
//! bootstrap address once. Every new stream starts with a CBOR `Hello`
//! naming the discovery key, and the answering side drops peers asking for
//! a topic it has not announced. After the handshake, messages travel as
//! length-prefixed frames (u32, big-endian).
//!
//! Peers are identified by the address they listen on: the dialed address
//! for outbound streams, and the source IP plus the port carried in `Hello`
//! for inbound ones. Two nodes that dial each other therefore name each
//! other the same way on both streams, and the fabric keeps only one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::FabricConfig;

use super::topic::{DiscoveryKey, JoinOptions};
use super::transport::{Discovery, DiscoveryEvent, PeerConnection};
use super::{FabricError, PeerId};

const EVENT_QUEUE: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    key: DiscoveryKey,
    node: Uuid,
    /// Port the sender accepts peers on, if it announces.
    listen_port: Option<u16>,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FabricError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| FabricError::SerializationError(e.to_string()))?;
    Ok(buf)
}

fn decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T, FabricError> {
    ciborium::from_reader(data).map_err(|e| FabricError::SerializationError(e.to_string()))
}

/// Write one length-prefixed frame.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    max: usize,
) -> Result<(), FabricError> {
    if data.len() > max {
        return Err(FabricError::FrameTooLarge {
            size: data.len(),
            max,
        });
    }
    let len = u32::try_from(data.len()).map_err(|_| FabricError::FrameTooLarge {
        size: data.len(),
        max,
    })?;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| FabricError::IoError(e.to_string()))?;
    writer
        .write_all(data)
        .await
        .map_err(|e| FabricError::IoError(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| FabricError::IoError(e.to_string()))
}

/// Read one length-prefixed frame, refusing frames over `max` bytes.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max: usize,
) -> Result<Vec<u8>, FabricError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| FabricError::IoError(e.to_string()))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(FabricError::FrameTooLarge { size: len, max });
    }
    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|e| FabricError::IoError(e.to_string()))?;
    Ok(data)
}

/// State shared with the listener, handshake and dial tasks.
struct TcpShared {
    node_id: Uuid,
    topics: RwLock<HashMap<DiscoveryKey, JoinOptions>>,
    events_tx: mpsc::Sender<DiscoveryEvent>,
    handshake_timeout: Duration,
    max_frame: usize,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl TcpShared {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|a| *a)
    }

    fn hello(&self, key: DiscoveryKey) -> Hello {
        Hello {
            key,
            node: self.node_id,
            listen_port: self.local_addr().map(|a| a.port()),
        }
    }

    async fn report_failure(&self, key: Option<DiscoveryKey>, error: FabricError) {
        log::warn!("TCP discovery failed: {}", error);
        let _ = self.events_tx.send(DiscoveryEvent::Failed { key, error }).await;
    }

    async fn accept_inbound(self: Arc<Self>, mut stream: TcpStream, addr: SocketAddr) {
        let handshake = async {
            let hello: Hello = decode(&read_frame(&mut stream, self.max_frame).await?)?;
            if hello.node == self.node_id {
                return Err(FabricError::Handshake("connected to self".to_string()));
            }
            let announced = self
                .topics
                .read()
                .await
                .get(&hello.key)
                .map(|o| o.announce)
                .unwrap_or(false);
            if !announced {
                return Err(FabricError::Handshake(format!(
                    "topic {} is not announced here",
                    hello.key.short()
                )));
            }
            let reply = encode(&self.hello(hello.key))?;
            write_frame(&mut stream, &reply, self.max_frame).await?;
            Ok::<_, FabricError>((hello.key, hello.listen_port))
        };

        let outcome = tokio::time::timeout(self.handshake_timeout, handshake).await;
        match outcome {
            Ok(Ok((key, listen_port))) => {
                let peer = match listen_port {
                    Some(port) => PeerId::new(SocketAddr::new(addr.ip(), port).to_string()),
                    None => PeerId::new(addr.to_string()),
                };
                log::debug!("Accepted {} from {} on topic {}", peer, addr, key.short());
                let connection = TcpConnection::new(stream, peer, self.max_frame);
                let _ = self
                    .events_tx
                    .send(DiscoveryEvent::Connected {
                        key,
                        connection: Box::new(connection),
                    })
                    .await;
            }
            Ok(Err(e)) => log::debug!("Rejected inbound {}: {}", addr, e),
            Err(_) => log::debug!("Inbound {} timed out during handshake", addr),
        }
    }

    async fn dial(self: Arc<Self>, addr: String, key: DiscoveryKey) {
        let handshake = async {
            let mut stream = TcpStream::connect(&addr)
                .await
                .map_err(|e| FabricError::Discovery(format!("dial {}: {}", addr, e)))?;
            let hello = encode(&self.hello(key))?;
            write_frame(&mut stream, &hello, self.max_frame).await?;
            let reply: Hello = decode(&read_frame(&mut stream, self.max_frame).await?)
                .map_err(|e| FabricError::Handshake(format!("{}: {}", addr, e)))?;
            if reply.key != key {
                return Err(FabricError::Handshake(format!(
                    "{} answered for a different topic",
                    addr
                )));
            }
            Ok::<_, FabricError>((stream, reply.node))
        };

        let outcome = tokio::time::timeout(self.handshake_timeout, handshake).await;
        match outcome {
            Ok(Ok((_, node))) if node == self.node_id => {
                log::debug!("Bootstrap address {} is this node", addr);
            }
            Ok(Ok((stream, _))) => {
                log::debug!("Connected to {} on topic {}", addr, key.short());
                // Resolved, so a hostname dial names the peer like its inbound stream.
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or(addr);
                let connection = TcpConnection::new(stream, PeerId::new(peer), self.max_frame);
                let _ = self
                    .events_tx
                    .send(DiscoveryEvent::Connected {
                        key,
                        connection: Box::new(connection),
                    })
                    .await;
            }
            Ok(Err(FabricError::IoError(e))) => {
                self.report_failure(
                    Some(key),
                    FabricError::Handshake(format!("{} closed during handshake: {}", addr, e)),
                )
                .await
            }
            Ok(Err(e)) => self.report_failure(Some(key), e).await,
            Err(_) => {
                self.report_failure(
                    Some(key),
                    FabricError::Handshake(format!("{} timed out", addr)),
                )
                .await
            }
        }
    }
}

/// Discovery over plain TCP with static bootstrap addresses.
pub struct TcpDiscovery {
    shared: Arc<TcpShared>,
    listen_addr: String,
    bootstrap: Vec<String>,
    events_rx: Mutex<mpsc::Receiver<DiscoveryEvent>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl TcpDiscovery {
    pub fn new(config: &FabricConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(TcpShared {
                node_id: Uuid::new_v4(),
                topics: RwLock::new(HashMap::new()),
                events_tx,
                handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
                max_frame: config.max_frame_bytes,
                local_addr: StdMutex::new(None),
            }),
            listen_addr: config.listen_addr.clone(),
            bootstrap: config.bootstrap.clone(),
            events_rx: Mutex::new(events_rx),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Address the listener is bound to, once announcing.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr()
    }

    async fn ensure_listening(&self) -> Result<(), FabricError> {
        let mut listener_task = self.listener.lock().await;
        if listener_task.is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|e| FabricError::Discovery(format!("bind {}: {}", self.listen_addr, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| FabricError::IoError(e.to_string()))?;
        if let Ok(mut local) = self.shared.local_addr.lock() {
            *local = Some(addr);
        }
        log::info!("Listening for peers on {}", addr);

        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown_tx.subscribe();
        *listener_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            tokio::spawn(Arc::clone(&shared).accept_inbound(stream, addr));
                        }
                        Err(e) => {
                            shared
                                .report_failure(None, FabricError::IoError(format!("accept: {}", e)))
                                .await;
                            break;
                        }
                    },
                    _ = shutdown.recv() => break,
                }
            }
        }));
        Ok(())
    }
}

#[async_trait]
impl Discovery for TcpDiscovery {
    async fn join(&self, key: DiscoveryKey, options: JoinOptions) -> Result<(), FabricError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FabricError::Closed);
        }
        self.shared.topics.write().await.insert(key, options);

        if options.announce {
            self.ensure_listening().await?;
        }
        if options.discover {
            for addr in &self.bootstrap {
                tokio::spawn(Arc::clone(&self.shared).dial(addr.clone(), key));
            }
        }
        Ok(())
    }

    async fn leave(&self, key: &DiscoveryKey) -> Result<(), FabricError> {
        self.shared.topics.write().await.remove(key);
        Ok(())
    }

    async fn next_event(&self) -> Option<DiscoveryEvent> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut rx = self.events_rx.lock().await;
        tokio::select! {
            event = rx.recv() => event,
            _ = shutdown.recv() => None,
        }
    }

    async fn shutdown(&self) -> Result<(), FabricError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.listener.lock().await.take() {
            task.abort();
        }
        self.shared.topics.write().await.clear();
        Ok(())
    }
}

/// A framed TCP stream to one peer.
pub struct TcpConnection {
    peer_id: PeerId,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    connected: AtomicBool,
    closed_tx: watch::Sender<bool>,
    max_frame: usize,
}

impl TcpConnection {
    fn new(stream: TcpStream, peer_id: PeerId, max_frame: usize) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let (closed_tx, _) = watch::channel(false);
        Self {
            peer_id,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            connected: AtomicBool::new(true),
            closed_tx,
            max_frame,
        }
    }

    fn closed_error(&self) -> FabricError {
        FabricError::ConnectionClosed(self.peer_id.clone())
    }
}

#[async_trait]
impl PeerConnection for TcpConnection {
    async fn send(&self, data: &[u8]) -> Result<(), FabricError> {
        if !self.is_connected() {
            return Err(self.closed_error());
        }
        let mut writer = self.writer.lock().await;
        match write_frame(&mut *writer, data, self.max_frame).await {
            Ok(()) => Ok(()),
            Err(e @ FabricError::FrameTooLarge { .. }) => Err(e),
            Err(_) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(self.closed_error())
            }
        }
    }

    async fn recv(&self) -> Result<Vec<u8>, FabricError> {
        let mut closed = self.closed_tx.subscribe();
        if *closed.borrow() {
            return Err(self.closed_error());
        }
        let mut reader = self.reader.lock().await;
        let result = tokio::select! {
            frame = read_frame(&mut *reader, self.max_frame) => frame,
            _ = closed.changed() => Err(self.closed_error()),
        };
        match result {
            Ok(data) => Ok(data),
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                match e {
                    FabricError::IoError(_) => Err(self.closed_error()),
                    other => Err(other),
                }
            }
        }
    }

    async fn close(&self) -> Result<(), FabricError> {
        self.connected.store(false, Ordering::SeqCst);
        self.closed_tx.send_replace(true);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }

    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::swarm::{FabricEvent, PeerFabric};
    use crate::fabric::topic::DiscoveryTopic;

    async fn wait_for_peer_count(fabric: &PeerFabric, n: usize) {
        for _ in 0..400 {
            if fabric.peer_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} peers, have {}", n, fabric.peer_count());
    }

    fn config(bootstrap: Vec<String>) -> FabricConfig {
        FabricConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            bootstrap,
            handshake_timeout_ms: 2_000,
            ..FabricConfig::default()
        }
    }

    #[tokio::test]
    async fn test_frame_round_trip_and_limit() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"framed", 16).await.unwrap();
        assert_eq!(read_frame(&mut b, 16).await.unwrap(), b"framed");

        assert_eq!(
            write_frame(&mut a, &[0u8; 17], 16).await,
            Err(FabricError::FrameTooLarge { size: 17, max: 16 })
        );

        // A peer claiming a huge frame is refused before allocating it.
        a.write_all(&1_000_000u32.to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b, 16).await,
            Err(FabricError::FrameTooLarge { size: 1_000_000, .. })
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_connects_and_exchanges_frames() {
        let key = DiscoveryTopic::from("tcp-room").key();
        let listener = TcpDiscovery::new(&config(Vec::new()));
        listener
            .join(
                key,
                JoinOptions {
                    discover: false,
                    announce: true,
                },
            )
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = TcpDiscovery::new(&config(vec![addr.to_string()]));
        dialer
            .join(
                key,
                JoinOptions {
                    discover: true,
                    announce: false,
                },
            )
            .await
            .unwrap();

        let Some(DiscoveryEvent::Connected { connection: out, .. }) = dialer.next_event().await
        else {
            panic!("dialer did not connect");
        };
        let Some(DiscoveryEvent::Connected { key: got, connection: inbound }) =
            listener.next_event().await
        else {
            panic!("listener did not accept");
        };
        assert_eq!(got, key);
        assert_eq!(out.peer_id().as_str(), addr.to_string());

        out.send(b"ping").await.unwrap();
        assert_eq!(inbound.recv().await.unwrap(), b"ping");
        inbound.send(b"pong").await.unwrap();
        assert_eq!(out.recv().await.unwrap(), b"pong");

        out.close().await.unwrap();
        assert!(inbound.recv().await.is_err());

        listener.shutdown().await.unwrap();
        dialer.shutdown().await.unwrap();
        assert!(listener.next_event().await.is_none());
    }

    /// Two nodes that each dial the other end up sharing one stream.
    #[tokio::test]
    async fn test_mutual_bootstrap_keeps_one_stream() {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let second_addr = reserved.local_addr().unwrap();
        drop(reserved);

        let topic = DiscoveryTopic::from("mutual");
        let first_discovery = Arc::new(TcpDiscovery::new(&config(vec![second_addr.to_string()])));
        let first = PeerFabric::new(first_discovery.clone(), 64);
        first
            .join(
                &topic,
                JoinOptions {
                    discover: false,
                    announce: true,
                },
            )
            .await
            .unwrap();
        let first_addr = first_discovery.local_addr().unwrap();

        let mut second_config = config(vec![first_addr.to_string()]);
        second_config.listen_addr = second_addr.to_string();
        let second = PeerFabric::new(Arc::new(TcpDiscovery::new(&second_config)), 64);
        let mut second_events = second.subscribe();
        second.join(&topic, JoinOptions::default()).await.unwrap();
        wait_for_peer_count(&first, 1).await;

        // The first node now dials back over the second, redundant stream.
        first.join(&topic, JoinOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(first.peers().await, vec![PeerId::new(second_addr.to_string())]);
        assert_eq!(second.peers().await, vec![PeerId::new(first_addr.to_string())]);

        let report = first.broadcast(b"once").await.unwrap();
        assert_eq!(report.delivered.len(), 1);
        let mut received = 0;
        while let Ok(Ok(event)) =
            tokio::time::timeout(Duration::from_millis(300), second_events.recv()).await
        {
            if let FabricEvent::Data { data, .. } = event {
                assert_eq!(data, b"once".to_vec());
                received += 1;
            }
        }
        assert_eq!(received, 1);

        first.close().await.unwrap();
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_topic_is_refused() {
        let listener = TcpDiscovery::new(&config(Vec::new()));
        listener
            .join(DiscoveryTopic::from("one").key(), JoinOptions::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = TcpDiscovery::new(&config(vec![addr.to_string()]));
        let other = DiscoveryTopic::from("two").key();
        dialer
            .join(
                other,
                JoinOptions {
                    discover: true,
                    announce: false,
                },
            )
            .await
            .unwrap();

        match dialer.next_event().await {
            Some(DiscoveryEvent::Failed { key, error }) => {
                assert_eq!(key, Some(other));
                assert!(matches!(error, FabricError::Handshake(_)));
            }
            _ => panic!("expected a handshake failure"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_bootstrap_reported_once() {
        let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = free.local_addr().unwrap();
        drop(free);

        let dialer = TcpDiscovery::new(&config(vec![addr.to_string()]));
        let key = DiscoveryTopic::from("lonely").key();
        dialer
            .join(
                key,
                JoinOptions {
                    discover: true,
                    announce: false,
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            dialer.next_event().await,
            Some(DiscoveryEvent::Failed {
                error: FabricError::Discovery(_),
                ..
            })
        ));
        let again =
            tokio::time::timeout(Duration::from_millis(200), dialer.next_event()).await;
        assert!(again.is_err(), "failure must not be retried");
    }

    #[tokio::test]
    async fn test_bind_failure_returned_from_join() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut cfg = config(Vec::new());
        cfg.listen_addr = taken.local_addr().unwrap().to_string();

        let discovery = TcpDiscovery::new(&cfg);
        let result = discovery
            .join(DiscoveryTopic::from("x").key(), JoinOptions::default())
            .await;
        assert!(matches!(result, Err(FabricError::Discovery(_))));
    }
}
