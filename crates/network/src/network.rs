//! Peer network: accept loop, bootstrap dialers, per-connection tasks,
//! dispatch loop and liveness sweep.

use crate::error::{NetworkError, NetworkResult};
use crate::message::{GossipMessage, MessageType};
use crate::peer::{Peer, PeerTable};
use crate::IDENTITY_HEADER;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::AbortHandle,
};
use tokio_tungstenite::{
    accept_hdr_async, connect_async,
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::HeaderValue,
        Message,
    },
    WebSocketStream,
};

/// Receives decoded gossip from the dispatch loop.
///
/// This is the only path from the network into validator state. Returned
/// messages are broadcast to the mesh.
#[async_trait]
pub trait GossipHandler: Send + Sync {
    async fn handle(&self, from: &str, message: GossipMessage) -> Vec<GossipMessage>;
}

/// Configuration for the peer network
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address to accept peer connections on
    pub listen_addr: String,
    /// Peers dialed at startup until connected
    pub bootstrap_peers: Vec<String>,
    /// Capacity of the decoded inbound message queue
    pub inbound_queue_capacity: usize,
    /// Capacity of each connection's outbound frame queue
    pub outbound_queue_capacity: usize,
    /// How often stale peers are pruned
    pub sweep_interval: Duration,
    /// Peers silent for longer than this are pruned
    pub inactivity_threshold: Duration,
    /// Delay between bootstrap dial attempts
    pub redial_interval: Duration,
    /// Consecutive malformed frames tolerated before disconnecting
    pub max_protocol_errors: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9000".to_string(),
            bootstrap_peers: Vec::new(),
            inbound_queue_capacity: 1000,
            outbound_queue_capacity: 256,
            sweep_interval: Duration::from_secs(30),
            inactivity_threshold: Duration::from_secs(90),
            redial_interval: Duration::from_secs(5),
            max_protocol_errors: 8,
        }
    }
}

/// Stats about the peer network
#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkStats {
    pub peers: usize,
    pub active_peers: usize,
    pub messages_received: u64,
    pub messages_broadcast: u64,
    pub messages_rejected: u64,
    pub broadcast_failures: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    broadcast: AtomicU64,
    rejected: AtomicU64,
    broadcast_failures: AtomicU64,
}

/// Live handle to one peer connection
struct Connection {
    id: u64,
    outbound: mpsc::Sender<String>,
    reader: AbortHandle,
}

struct Inbound {
    from: String,
    message: GossipMessage,
}

/// State shared by every network task
struct Shared {
    config: NetworkConfig,
    identity: String,
    peers: PeerTable,
    connections: DashMap<String, Connection>,
    /// Serializes the identity check and insert in `register`
    registration: Mutex<()>,
    inbound_tx: mpsc::Sender<Inbound>,
    shutdown_rx: watch::Receiver<bool>,
    next_connection_id: AtomicU64,
    counters: Counters,
}

/// Best-effort broadcast mesh
pub struct PeerNetwork {
    shared: Arc<Shared>,
    handler: Arc<dyn GossipHandler>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl PeerNetwork {
    /// Create a new network. `identity` is announced to peers in the handshake.
    pub fn new(config: NetworkConfig, identity: String, handler: Arc<dyn GossipHandler>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                config,
                identity,
                peers: PeerTable::new(),
                connections: DashMap::new(),
                registration: Mutex::new(()),
                inbound_tx,
                shutdown_rx,
                next_connection_id: AtomicU64::new(1),
                counters: Counters::default(),
            }),
            handler,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            shutdown_tx,
            running: AtomicBool::new(false),
            local_addr: RwLock::new(None),
        }
    }

    /// Bind the listener and launch the network tasks.
    ///
    /// Failing to bind is fatal and returned to the caller.
    pub async fn start(&self) -> NetworkResult<()> {
        let inbound_rx = self
            .inbound_rx
            .lock()
            .take()
            .ok_or(NetworkError::AlreadyRunning)?;

        let listener = TcpListener::bind(&self.shared.config.listen_addr)
            .await
            .map_err(|e| NetworkError::Bind(format!("{}: {}", self.shared.config.listen_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetworkError::Bind(e.to_string()))?;
        *self.local_addr.write() = Some(local_addr);
        self.running.store(true, Ordering::SeqCst);

        tracing::info!("Peer network listening on {}", local_addr);

        tokio::spawn(accept_loop(self.shared.clone(), listener));
        tokio::spawn(dispatch_loop(
            self.shared.clone(),
            self.handler.clone(),
            inbound_rx,
        ));
        tokio::spawn(sweep_loop(self.shared.clone()));

        for address in &self.shared.config.bootstrap_peers {
            tokio::spawn(dial_loop(self.shared.clone(), address.clone()));
        }

        Ok(())
    }

    /// Stop all tasks and close every peer connection
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.shutdown_tx.send_replace(true);

        let addresses: Vec<String> = self
            .shared
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for address in &addresses {
            self.shared.close_peer(address);
        }

        tracing::info!("Peer network stopped, closed {} connections", addresses.len());
    }

    /// Serialize once and queue on every active connection.
    ///
    /// Returns the number of peers the message was queued for. A peer whose
    /// connection cannot take the frame is marked inactive; the broadcast
    /// itself never fails.
    pub fn broadcast(&self, message: &GossipMessage) -> usize {
        self.shared.broadcast(message)
    }

    /// Gossip a new validation request to the mesh
    pub fn broadcast_validation_request(
        &self,
        request_id: &str,
        payment_id: &str,
        message_hash: &str,
        required_signatures: u32,
        is_high_value: bool,
    ) -> usize {
        self.broadcast(&GossipMessage::validation_request(
            request_id,
            payment_id,
            message_hash,
            required_signatures,
            is_high_value,
        ))
    }

    /// Gossip this node's signature share
    pub fn broadcast_signature(
        &self,
        request_id: &str,
        payment_id: &str,
        message_hash: &str,
        signer: &str,
        signature: &str,
    ) -> usize {
        self.broadcast(&GossipMessage::signature_share(
            request_id,
            payment_id,
            message_hash,
            signer,
            signature,
        ))
    }

    /// Snapshot of peer descriptors
    pub fn get_peers(&self) -> Vec<Peer> {
        self.shared.peers.snapshot()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound listener address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// This node's announced identity
    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    pub fn stats(&self) -> NetworkStats {
        let counters = &self.shared.counters;
        NetworkStats {
            peers: self.shared.peers.len(),
            active_peers: self.shared.peers.active_count(),
            messages_received: counters.received.load(Ordering::Relaxed),
            messages_broadcast: counters.broadcast.load(Ordering::Relaxed),
            messages_rejected: counters.rejected.load(Ordering::Relaxed),
            broadcast_failures: counters.broadcast_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for PeerNetwork {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn broadcast(&self, message: &GossipMessage) -> usize {
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to encode {} message: {}", message.kind, e);
                return 0;
            }
        };

        let active = self.peers.active_addresses();
        let targets: Vec<(String, mpsc::Sender<String>)> = active
            .into_iter()
            .filter_map(|address| {
                let outbound = self.connections.get(&address)?.outbound.clone();
                Some((address, outbound))
            })
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (address, outbound) in targets {
            match outbound.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!("Broadcast to peer {} failed: {}", address, e);
                    failed.push(address);
                }
            }
        }

        for address in &failed {
            self.peers.mark_inactive(address);
        }

        self.counters.broadcast.fetch_add(1, Ordering::Relaxed);
        self.counters
            .broadcast_failures
            .fetch_add(failed.len() as u64, Ordering::Relaxed);

        tracing::debug!(
            "Broadcast {} for request {} to {} peers ({} failed)",
            message.kind,
            message.request_id,
            delivered,
            failed.len()
        );

        delivered
    }

    /// Whether a connection to `remote_key` is the one both ends keep when
    /// two nodes dial each other: the one dialed by the smaller identity.
    fn keeps_connection(&self, remote_key: &str, inbound: bool) -> bool {
        let local = self.identity.as_str();
        if inbound {
            remote_key < local
        } else {
            local < remote_key
        }
    }

    /// Track a freshly upgraded connection and spawn its reader and writer.
    ///
    /// At most one connection is kept per remote identity. When both nodes
    /// dialed each other, both ends settle on the same socket.
    fn register<S>(
        self: &Arc<Self>,
        address: String,
        public_key: Option<String>,
        ws: WebSocketStream<S>,
        inbound: bool,
    ) -> NetworkResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let _registering = self.registration.lock();

        if let Some(key) = public_key.as_deref() {
            let existing = self
                .peers
                .address_for_key(key)
                .filter(|existing| *existing != address);
            if let Some(existing) = existing {
                if !self.keeps_connection(key, inbound) {
                    tracing::debug!(
                        "Dropping second connection to {} at {}, keeping {}",
                        key,
                        address,
                        existing
                    );
                    return Err(NetworkError::DuplicatePeer(existing));
                }
                tracing::debug!("Replacing connection to {} at {} with {}", key, existing, address);
                self.close_peer(&existing);
            }
        }

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        match self.connections.entry(address.clone()) {
            Entry::Occupied(_) => return Err(NetworkError::DuplicatePeer(address)),
            Entry::Vacant(slot) => {
                let (sink, stream) = ws.split();
                let (outbound_tx, outbound_rx) =
                    mpsc::channel(self.config.outbound_queue_capacity.max(1));

                // Both tables are filled before the reader can end the connection
                self.peers.insert(Peer::new(address.clone(), public_key, inbound));
                let reader = tokio::spawn(read_loop(self.clone(), address.clone(), id, stream));
                slot.insert(Connection {
                    id,
                    outbound: outbound_tx,
                    reader: reader.abort_handle(),
                });
                tokio::spawn(write_loop(self.clone(), address.clone(), sink, outbound_rx));
            }
        }

        tracing::info!(
            "Peer {} connected ({})",
            address,
            if inbound { "inbound" } else { "outbound" }
        );

        Ok(())
    }

    /// Drop a connection after its reader ended, unless it was replaced
    fn connection_ended(&self, address: &str, id: u64) {
        if self
            .connections
            .remove_if(address, |_, conn| conn.id == id)
            .is_some()
        {
            self.peers.remove(address);
            tracing::info!("Peer {} disconnected", address);
        }
    }

    /// Forcefully close a peer's connection and forget it
    fn close_peer(&self, address: &str) {
        if let Some((_, conn)) = self.connections.remove(address) {
            conn.reader.abort();
        }
        self.peers.remove(address);
    }

    /// Prune inactive and silent peers
    fn sweep(&self) -> Vec<String> {
        let threshold = chrono::Duration::from_std(self.config.inactivity_threshold)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let stale = self.peers.remove_stale(Utc::now(), threshold);

        for address in &stale {
            if let Some((_, conn)) = self.connections.remove(address) {
                conn.reader.abort();
            }
            tracing::info!("Pruned stale peer {}", address);
        }

        stale
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let mut shutdown = shared.shutdown_rx.clone();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = accept_peer(shared, stream, peer_addr).await {
                            tracing::warn!("Inbound connection from {} failed: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!("Accept loop stopped");
}

async fn accept_peer(shared: Arc<Shared>, stream: TcpStream, peer_addr: SocketAddr) -> NetworkResult<()> {
    let mut remote_key = None;
    let identity = shared.identity.clone();

    let ws = accept_hdr_async(stream, |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        remote_key = request
            .headers()
            .get(IDENTITY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Ok(value) = HeaderValue::from_str(&identity) {
            response.headers_mut().insert(IDENTITY_HEADER, value);
        }
        Ok(response)
    })
    .await?;

    shared.register(peer_addr.to_string(), remote_key, ws, true)
}

async fn dial_loop(shared: Arc<Shared>, address: String) {
    let mut shutdown = shared.shutdown_rx.clone();

    loop {
        if *shutdown.borrow() || shared.connections.contains_key(&address) {
            break;
        }

        match dial(&shared, &address).await {
            Ok(()) => break,
            Err(NetworkError::DuplicatePeer(_)) => break,
            Err(e) => {
                tracing::debug!(
                    "Dial {} failed: {}, retrying in {:?}",
                    address,
                    e,
                    shared.config.redial_interval
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(shared.config.redial_interval) => {}
            _ = shutdown.changed() => break,
        }
    }
}

async fn dial(shared: &Arc<Shared>, address: &str) -> NetworkResult<()> {
    let mut request = format!("ws://{}", address).into_client_request()?;
    let identity = HeaderValue::from_str(&shared.identity)
        .map_err(|e| NetworkError::Protocol(format!("Invalid identity header: {}", e)))?;
    request.headers_mut().insert(IDENTITY_HEADER, identity);

    let (ws, response) = connect_async(request).await?;
    let remote_key = response
        .headers()
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    shared.register(address.to_string(), remote_key, ws, false)
}

async fn write_loop<S>(
    shared: Arc<Shared>,
    address: String,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(Message::Text(frame)).await {
            tracing::warn!("Write to peer {} failed: {}", address, e);
            shared.peers.mark_inactive(&address);
            break;
        }
    }

    let _ = sink.close().await;
}

async fn read_loop<S>(
    shared: Arc<Shared>,
    address: String,
    id: u64,
    mut stream: SplitStream<WebSocketStream<S>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut protocol_errors = 0u32;

    while let Some(frame) = stream.next().await {
        let payload = match frame {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("Connection error from peer {}: {}", address, e);
                break;
            }
        };

        let message = match GossipMessage::from_slice(&payload) {
            Ok(message) => message,
            Err(e) => {
                protocol_errors += 1;
                shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Malformed message from peer {}: {}", address, e);
                if protocol_errors >= shared.config.max_protocol_errors {
                    tracing::warn!(
                        "Disconnecting peer {} after {} malformed messages",
                        address,
                        protocol_errors
                    );
                    break;
                }
                continue;
            }
        };

        protocol_errors = 0;
        shared.peers.touch(&address, Utc::now());
        shared.counters.received.fetch_add(1, Ordering::Relaxed);

        let inbound = Inbound {
            from: address.clone(),
            message,
        };
        if shared.inbound_tx.send(inbound).await.is_err() {
            // Inbound queue closed: shutting down
            break;
        }
    }

    shared.connection_ended(&address, id);
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    handler: Arc<dyn GossipHandler>,
    mut inbound_rx: mpsc::Receiver<Inbound>,
) {
    let mut shutdown = shared.shutdown_rx.clone();

    loop {
        tokio::select! {
            inbound = inbound_rx.recv() => match inbound {
                Some(inbound) => dispatch(&shared, handler.as_ref(), inbound).await,
                None => break,
            },
            _ = shutdown.changed() => {
                inbound_rx.close();
                while let Some(inbound) = inbound_rx.recv().await {
                    dispatch(&shared, handler.as_ref(), inbound).await;
                }
                break;
            }
        }
    }

    tracing::debug!("Dispatch loop stopped");
}

async fn dispatch(shared: &Shared, handler: &dyn GossipHandler, inbound: Inbound) {
    match &inbound.message.kind {
        MessageType::Unknown(kind) => {
            shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Rejected message with unknown type '{}' from {}",
                kind,
                inbound.from
            );
            return;
        }
        kind => {
            tracing::trace!(
                "Dispatching {} for request {} from {}",
                kind,
                inbound.message.request_id,
                inbound.from
            );
        }
    }

    let replies = handler.handle(&inbound.from, inbound.message).await;
    for reply in &replies {
        shared.broadcast(reply);
    }
}

async fn sweep_loop(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown_rx.clone();
    let mut ticker = tokio::time::interval(shared.config.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pruned = shared.sweep();
                if !pruned.is_empty() {
                    tracing::debug!("Sweep pruned {} peers", pruned.len());
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
