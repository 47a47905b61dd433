//! TCP transport: the sans-io connection core, the tokio client, and
//! the listener provider.
//!
//! The core owns the receive buffer and header state machine and knows
//! nothing about sockets; the driver tasks around it keep the
//! single-receive / single-send invariant by construction (one recv
//! loop, one send loop per connection).

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use tempest_proto::TypeRegistry;
use tempest_proto::constants::INTERNAL_PROTOCOL_ID;

use crate::config::TempestConfig;
use crate::connection::{
    ConnectionEvent, ConnectionState, DisconnectInfo, ReplayGuard, Shared, finish,
};
use crate::control::PingMessage;
use crate::crypto::{AuthKey, RsaAuthKey, SessionCrypto, SigningHash};
use crate::dispatch::{ConnectionTx, Dispatcher, FrameId, Outbound};
use crate::error::{ConnectionResult, Error, Result};
use crate::framer::{Framer, HeaderPoll, HeaderState};
use crate::handshake::{HandshakeClient, HandshakeServer};
use crate::message::{ConnectionId, Message, MessageId};
use crate::protocol::ProtocolRegistry;
use crate::reliable::MessageIdAllocator;
use crate::responses::ResponseFuture;
use crate::routing::{self, ConnectionMade, Phase};

/// Sans-io TCP connection state: receive buffer, header state machine,
/// replay guard and outbound framing.
pub struct TcpConnectionCore {
    framer: Framer,
    allocator: Arc<Mutex<MessageIdAllocator>>,
    guard: ReplayGuard,
    connection_id: ConnectionId,
    buffer: Vec<u8>,
    filled: usize,
    message_offset: usize,
    header: HeaderState,
    events: VecDeque<ConnectionEvent>,
}

impl TcpConnectionCore {
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        types: Arc<TypeRegistry>,
        config: &TempestConfig,
        allocator: Arc<Mutex<MessageIdAllocator>>,
    ) -> Self {
        TcpConnectionCore {
            framer: Framer::new(registry, types, config.max_message_size),
            allocator,
            guard: ReplayGuard::new(),
            connection_id: ConnectionId::NONE,
            buffer: vec![0; config.recv_buffer_len],
            filled: 0,
            message_offset: 0,
            header: HeaderState::new(),
            events: VecDeque::new(),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn set_connection_id(&mut self, id: ConnectionId) {
        self.connection_id = id;
    }

    pub fn framer(&self) -> &Framer {
        &self.framer
    }

    pub fn install_crypto(&mut self, crypto: Arc<Mutex<SessionCrypto>>) {
        self.framer.install_crypto(crypto);
    }

    /// Frames an outbound message under an id assigned at enqueue time.
    pub fn frame_outbound(&mut self, message: &dyn Message, frame_id: FrameId) -> Result<Vec<u8>> {
        let (id, is_response) = match frame_id {
            FrameId::Fresh(id) => (id, false),
            FrameId::ResponseTo(id) => (id, true),
            FrameId::Unreliable => (MessageId::UNRELIABLE, false),
        };
        self.framer.frame(message, self.connection_id, id, is_response)
    }

    /// Frames and signs the handshake's final message with a fresh id.
    pub fn frame_with_key(
        &mut self,
        message: &dyn Message,
        key: &dyn AuthKey,
        hash: SigningHash,
    ) -> Result<Vec<u8>> {
        let id = self.allocator.lock().allocate();
        self.framer
            .frame_with_key(message, self.connection_id, id, key, hash)
    }

    /// Feeds received bytes into the buffer and advances parsing.
    /// An error names the disposition the connection must die with.
    pub fn on_bytes(&mut self, data: &[u8]) -> std::result::Result<(), ConnectionResult> {
        self.reserve(data.len());
        self.buffer[self.filled..self.filled + data.len()].copy_from_slice(data);
        self.filled += data.len();
        self.process()
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Makes room for `additional` inbound bytes: compact consumed
    /// frames out of the front, then grow to the declared frame length
    /// when a single message cannot fit.
    fn reserve(&mut self, additional: usize) {
        if self.filled + additional <= self.buffer.len() {
            return;
        }
        if self.message_offset > 0 {
            self.buffer.copy_within(self.message_offset..self.filled, 0);
            self.filled -= self.message_offset;
            self.message_offset = 0;
        }
        let needed = (self.filled + additional).max(self.header.frame_len().unwrap_or(0));
        if needed > self.buffer.len() {
            self.buffer.resize(needed, 0);
        }
    }

    fn process(&mut self) -> std::result::Result<(), ConnectionResult> {
        loop {
            let window_len = self.filled - self.message_offset;
            if window_len == 0 {
                break;
            }
            let poll = self
                .framer
                .try_read_header(&mut self.header, &self.buffer[self.message_offset..self.filled]);
            match poll {
                HeaderPoll::NeedMore => {
                    self.grow_for_declared();
                    break;
                }
                HeaderPoll::Invalid(reason) => {
                    debug!(?reason, "invalid inbound frame");
                    return Err(reason);
                }
                HeaderPoll::Complete => {
                    let frame_len = self.header.frame_len().expect("complete header");
                    if window_len < frame_len {
                        self.grow_for_declared();
                        break;
                    }
                    let state = std::mem::take(&mut self.header);
                    let (mut header, message) = state.finish();
                    self.guard.check(&header, self.allocator.lock().peek())?;

                    let start = self.message_offset;
                    let frame_end = start + frame_len;
                    let message = self
                        .framer
                        .read_payload(&mut header, message, &self.buffer[start..frame_end])
                        .map_err(|e| e.disposition())?;
                    let raw = (header.protocol_id == INTERNAL_PROTOCOL_ID)
                        .then(|| self.buffer[start..frame_end].to_vec());
                    trace!(
                        protocol = header.protocol_id,
                        message_type = header.message_type,
                        id = header.message_id.0,
                        "inbound message"
                    );
                    self.events.push_back(ConnectionEvent::Message {
                        header,
                        message,
                        raw,
                    });
                    self.message_offset = frame_end;
                }
            }
        }
        if self.message_offset == self.filled {
            self.message_offset = 0;
            self.filled = 0;
        }
        Ok(())
    }

    /// Grows the buffer when a declared frame exceeds what the current
    /// buffer can ever hold, moving the partial tail to the front.
    fn grow_for_declared(&mut self) {
        if let Some(declared) = self.header.frame_len()
            && declared > self.buffer.len() - self.message_offset
        {
            self.reserve(declared - (self.filled - self.message_offset));
        }
    }
}

impl std::fmt::Debug for TcpConnectionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnectionCore")
            .field("connection_id", &self.connection_id)
            .field("buffered", &(self.filled - self.message_offset))
            .finish_non_exhaustive()
    }
}

async fn send_loop(
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut write: OwnedWriteHalf,
    core: Arc<Mutex<TcpConnectionCore>>,
    shared: Arc<Shared>,
) {
    while let Some(outbound) = rx.recv().await {
        let bytes = match outbound {
            Outbound::Message { message, frame_id } => {
                match core.lock().frame_outbound(&*message, frame_id) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "failed to frame outbound message");
                        continue;
                    }
                }
            }
            Outbound::Raw(bytes) => bytes,
            Outbound::Close => break,
        };
        if let Err(e) = write.write_all(&bytes).await {
            debug!(error = %e, "socket write failed");
            finish(&shared, ConnectionResult::ConnectionFailed, None, false);
            break;
        }
    }
    let _ = write.shutdown().await;
}

impl routing::ConnectionCore for TcpConnectionCore {
    fn set_connection_id(&mut self, id: ConnectionId) {
        TcpConnectionCore::set_connection_id(self, id)
    }

    fn install_crypto(&mut self, crypto: Arc<Mutex<SessionCrypto>>) {
        TcpConnectionCore::install_crypto(self, crypto)
    }

    fn framer(&self) -> &Framer {
        &self.framer
    }

    fn frame_with_key(
        &mut self,
        message: &dyn Message,
        key: &dyn AuthKey,
        hash: SigningHash,
    ) -> Result<Vec<u8>> {
        TcpConnectionCore::frame_with_key(self, message, key, hash)
    }
}

async fn recv_loop(
    mut read: OwnedReadHalf,
    core: Arc<Mutex<TcpConnectionCore>>,
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
    mut phase: Phase,
) {
    let mut chunk = vec![0u8; shared.config.recv_buffer_len];
    loop {
        let n = match read.read(&mut chunk).await {
            Ok(0) => {
                finish(&shared, ConnectionResult::ConnectionFailed, None, false);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "socket read failed");
                finish(&shared, ConnectionResult::ConnectionFailed, None, false);
                break;
            }
        };
        if let Err(reason) = core.lock().on_bytes(&chunk[..n]) {
            finish(&shared, reason, None, true);
            break;
        }
        let alive = routing::drain_events(
            &core,
            &shared,
            &dispatcher,
            &mut phase,
            TcpConnectionCore::poll_event,
        );
        if !alive || *shared.state.lock() == ConnectionState::Disconnected {
            break;
        }
    }
}

/// Options for an outbound TCP client connection.
pub struct TcpClientOptions {
    pub registry: Arc<ProtocolRegistry>,
    pub types: Arc<TypeRegistry>,
    pub config: TempestConfig,
    /// The client's identity key; must hold the private half.
    pub auth_key: Arc<dyn AuthKey>,
    pub dispatcher: Arc<Dispatcher>,
    /// Seedable randomness for tests; defaults to OS entropy.
    pub rng: Option<StdRng>,
}

/// An established client connection.
pub struct TcpConnection {
    shared: Arc<Shared>,
    closed: watch::Receiver<Option<DisconnectInfo>>,
}

impl TcpConnection {
    /// Connects, runs the handshake, and resolves once `Connected`
    /// arrives or the attempt fails.
    pub async fn connect(addr: SocketAddr, options: TcpClientOptions) -> Result<Self> {
        let TcpClientOptions {
            registry,
            types,
            config,
            auth_key,
            dispatcher,
            rng,
        } = options;
        let rng = rng.unwrap_or_else(StdRng::from_entropy);

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();

        let allocator = Arc::new(Mutex::new(MessageIdAllocator::new()));
        let core = Arc::new(Mutex::new(TcpConnectionCore::new(
            registry.clone(),
            types,
            &config,
            allocator.clone(),
        )));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let tx = ConnectionTx::new(out_tx, allocator, false);
        let (closed_tx, closed_rx) = watch::channel(None);
        let shared = Arc::new(Shared::new(config, ConnectionId::NONE, tx, closed_tx));

        tokio::spawn(send_loop(out_rx, write, core.clone(), shared.clone()));

        let mut handshake = HandshakeClient::new(
            registry,
            auth_key,
            shared.config.allowed_hashes.clone(),
            rng,
        );
        let connect = handshake.start()?;
        shared.tx.send(Box::new(connect))?;

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(recv_loop(
            read,
            core,
            shared.clone(),
            dispatcher,
            Phase::ClientHandshake {
                handshake,
                done: Some(done_tx),
            },
        ));

        let timeout = shared.config.response_timeout;
        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(())) => Ok(TcpConnection {
                shared,
                closed: closed_rx,
            }),
            Ok(Err(_)) => {
                // The recv loop died before completing the handshake;
                // the watch channel knows why.
                let reason = closed_rx
                    .borrow()
                    .as_ref()
                    .map(|(reason, _)| *reason)
                    .unwrap_or(ConnectionResult::ConnectionFailed);
                Err(Error::Handshake(reason))
            }
            Err(_) => {
                finish(&shared, ConnectionResult::TimedOut, None, true);
                Err(Error::Timeout)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().is_connected()
    }

    pub fn connection_id(&self) -> ConnectionId {
        *self.shared.connection_id.lock()
    }

    /// The peer's public authentication key, once the handshake set it.
    pub fn remote_key(&self) -> Option<Arc<dyn AuthKey>> {
        self.shared.remote_key.lock().clone()
    }

    /// Last measured ping round trip.
    pub fn response_time(&self) -> Option<std::time::Duration> {
        self.shared.monitor.lock().response_time()
    }

    /// Sends a keep-alive probe; the next pong updates
    /// [`response_time`](Self::response_time).
    pub fn ping(&self) -> Result<()> {
        self.ensure_connected()?;
        self.shared.monitor.lock().on_ping_sent(Instant::now());
        self.shared.tx.send(Box::new(PingMessage {
            interval: self.shared.config.ping_interval,
        }))?;
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected("connection is not established"))
        }
    }

    pub fn send(&self, message: Box<dyn Message>) -> Result<MessageId> {
        self.ensure_connected()?;
        self.shared.tx.send(message)
    }

    /// Sends a message and returns a future for its paired response.
    pub fn send_for(
        &self,
        message: Box<dyn Message>,
        timeout: Option<std::time::Duration>,
    ) -> Result<ResponseFuture> {
        self.ensure_connected()?;
        let timeout = timeout.or(Some(self.shared.config.response_timeout));
        self.shared
            .tx
            .send_expecting(message, &self.shared.responses, timeout)
    }

    /// Graceful teardown: tells the peer why, drains queued sends, and
    /// resolves once the connection is fully down.
    pub async fn disconnect(&self, reason: ConnectionResult, text: Option<String>) {
        finish(&self.shared, reason, text, true);
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(Option::is_some).await;
    }

    /// Resolves with the terminal reason once the connection ends.
    pub async fn closed(&self) -> DisconnectInfo {
        let mut closed = self.closed.clone();
        match closed.wait_for(Option::is_some).await {
            Ok(value) => value.clone().expect("waited for some"),
            Err(_) => (ConnectionResult::ConnectionFailed, None),
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("connection_id", &self.connection_id())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Options for a listening TCP provider.
pub struct TcpServerOptions {
    pub registry: Arc<ProtocolRegistry>,
    pub types: Arc<TypeRegistry>,
    pub config: TempestConfig,
    /// Server identity key (private half required).
    pub auth_key: Arc<RsaAuthKey>,
    /// Key wrap target; defaults to `auth_key` when `None`.
    pub enc_key: Option<Arc<RsaAuthKey>>,
    pub dispatcher: Arc<Dispatcher>,
    pub on_connection: Option<ConnectionMade>,
    pub rng: Option<StdRng>,
}

/// A bound TCP listener accepting and handshaking peers.
pub struct TcpListenerProvider {
    local_addr: SocketAddr,
    peers: Arc<Mutex<HashMap<i32, Arc<Shared>>>>,
    shutdown: watch::Sender<bool>,
}

impl TcpListenerProvider {
    pub async fn bind(addr: SocketAddr, options: TcpServerOptions) -> Result<Self> {
        let TcpServerOptions {
            registry,
            types,
            config,
            auth_key,
            enc_key,
            dispatcher,
            on_connection,
            rng,
        } = options;
        let enc_key = enc_key.unwrap_or_else(|| auth_key.clone());
        let mut rng = rng.unwrap_or_else(StdRng::from_entropy);

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let peers: Arc<Mutex<HashMap<i32, Arc<Shared>>>> = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let next_id = Arc::new(AtomicI32::new(1));

        // Accept loop.
        {
            let peers = peers.clone();
            let config = config.clone();
            let mut shutdown = shutdown_rx.clone();
            let seed = rng.next_u64();
            tokio::spawn(async move {
                let mut accept_rng = StdRng::seed_from_u64(seed);
                loop {
                    let accepted = tokio::select! {
                        _ = shutdown.changed() => break,
                        accepted = listener.accept() => accepted,
                    };
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if peers.lock().len() >= config.max_connections {
                        debug!(%peer_addr, "at connection limit, rejecting");
                        drop(stream);
                        continue;
                    }
                    let connection_id = allocate_connection_id(&next_id, &peers);
                    let connection_rng = StdRng::seed_from_u64(accept_rng.next_u64());
                    spawn_server_connection(
                        stream,
                        peer_addr,
                        connection_id,
                        registry.clone(),
                        types.clone(),
                        config.clone(),
                        auth_key.clone(),
                        enc_key.clone(),
                        dispatcher.clone(),
                        on_connection.clone(),
                        peers.clone(),
                        connection_rng,
                    );
                }
            });
        }

        // Provider-wide ping timer.
        {
            let peers = peers.clone();
            let interval = config.ping_interval;
            let mut shutdown = shutdown_rx;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {}
                    }
                    let snapshot: Vec<(i32, Arc<Shared>)> = peers
                        .lock()
                        .iter()
                        .map(|(id, shared)| (*id, shared.clone()))
                        .collect();
                    for (id, shared) in snapshot {
                        if !shared.state.lock().is_connected() {
                            continue;
                        }
                        if shared.monitor.lock().timed_out() {
                            debug!(connection_id = id, "peer missed two pings");
                            finish(&shared, ConnectionResult::TimedOut, None, true);
                            peers.lock().remove(&id);
                            continue;
                        }
                        shared.monitor.lock().on_ping_sent(Instant::now());
                        let _ = shared.tx.send(Box::new(PingMessage { interval }));
                    }
                }
            });
        }

        Ok(TcpListenerProvider {
            local_addr,
            peers,
            shutdown: shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Round-trip time measured against one peer by the ping timer.
    pub fn response_time(&self, connection_id: ConnectionId) -> Option<std::time::Duration> {
        self.peers
            .lock()
            .get(&connection_id.0)
            .and_then(|shared| shared.monitor.lock().response_time())
    }

    /// Stops accepting and disconnects every peer gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let peers: Vec<Arc<Shared>> = self.peers.lock().values().cloned().collect();
        for shared in peers {
            finish(&shared, ConnectionResult::Success, None, true);
        }
        self.peers.lock().clear();
    }
}

impl std::fmt::Debug for TcpListenerProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListenerProvider")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// Monotonically increasing non-zero connection ids, checked unique
/// against the live set.
fn allocate_connection_id(
    next: &AtomicI32,
    peers: &Mutex<HashMap<i32, Arc<Shared>>>,
) -> ConnectionId {
    loop {
        let id = next.fetch_add(1, Ordering::Relaxed);
        if id <= 0 {
            next.store(1, Ordering::Relaxed);
            continue;
        }
        if !peers.lock().contains_key(&id) {
            return ConnectionId(id);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_server_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    connection_id: ConnectionId,
    registry: Arc<ProtocolRegistry>,
    types: Arc<TypeRegistry>,
    config: TempestConfig,
    auth_key: Arc<RsaAuthKey>,
    enc_key: Arc<RsaAuthKey>,
    dispatcher: Arc<Dispatcher>,
    on_connection: Option<ConnectionMade>,
    peers: Arc<Mutex<HashMap<i32, Arc<Shared>>>>,
    rng: StdRng,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    let (read, write) = stream.into_split();

    let allocator = Arc::new(Mutex::new(MessageIdAllocator::new()));
    let mut core_inner =
        TcpConnectionCore::new(registry.clone(), types, &config, allocator.clone());
    core_inner.set_connection_id(connection_id);
    let core = Arc::new(Mutex::new(core_inner));

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let tx = ConnectionTx::new(out_tx, allocator, false);
    let (closed_tx, _) = watch::channel(None);
    let shared = Arc::new(Shared::new(config.clone(), connection_id, tx, closed_tx));
    peers.lock().insert(connection_id.0, shared.clone());

    let handshake = Box::new(HandshakeServer::new(
        registry,
        auth_key,
        enc_key,
        config.allowed_hashes,
        connection_id,
        rng,
    ));

    tokio::spawn(send_loop(out_rx, write, core.clone(), shared.clone()));
    tokio::spawn(async move {
        recv_loop(
            read,
            core,
            shared,
            dispatcher,
            Phase::ServerHandshake {
                handshake,
                on_connection,
                peer_addr,
            },
        )
        .await;
        peers.lock().remove(&connection_id.0);
    });
}
