//! UDP transport: reliable delivery over a shared datagram socket.
//!
//! Each datagram carries exactly one frame. Logical connections are
//! multiplexed on the `connection_id` header field; the provider owns
//! one receive loop per address family and drives per-connection cores.
//! Reliable messages flow through the in-order queue, are acknowledged
//! in batches after routing, and retransmit from the pending-ack set on
//! a 100 ms delivery timer until acknowledged.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use tempest_proto::TypeRegistry;
use tempest_proto::constants::{
    BASE_HEADER_LEN, INTERNAL_PROTOCOL_ID, UDP_FRAGMENT_PAYLOAD,
};

use crate::config::TempestConfig;
use crate::connection::{
    ConnectionEvent, ConnectionState, DisconnectInfo, Shared, finish,
};
use crate::control::{self, AcknowledgeMessage, PartialMessage, PingMessage};
use crate::crypto::{AuthKey, RsaAuthKey, SessionCrypto, SigningHash};
use crate::dispatch::{ConnectionTx, Dispatcher, FrameId, Outbound};
use crate::error::{ConnectionResult, Error, Result};
use crate::framer::{Framer, HeaderPoll, HeaderState};
use crate::handshake::{HandshakeClient, HandshakeServer};
use crate::message::{ConnectionId, Message, MessageHeader, MessageId, downcast};
use crate::partial::{self, PartialAssembly};
use crate::protocol::ProtocolRegistry;
use crate::reliable::{Enqueue, MessageIdAllocator, PendingAck, ReliableQueue};
use crate::responses::ResponseFuture;
use crate::routing::{self, ConnectionMade, Phase};

/// A fully parsed inbound frame moving through the reliable machinery.
struct Parsed {
    header: MessageHeader,
    message: Box<dyn Message>,
    raw: Option<Vec<u8>>,
}

impl std::fmt::Debug for Parsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parsed")
            .field("protocol", &self.header.protocol_id)
            .field("message_type", &self.header.message_type)
            .field("id", &self.header.message_id)
            .finish()
    }
}

/// Sans-io state of one logical UDP connection: framing, the in-order
/// reliable queue, partial reassembly and the pending-ack set.
pub struct UdpConnectionCore {
    framer: Framer,
    allocator: Arc<Mutex<MessageIdAllocator>>,
    connection_id: ConnectionId,
    queue: ReliableQueue<Parsed>,
    assembly: PartialAssembly,
    pending: PendingAck,
    ack_ids: Vec<i32>,
    events: VecDeque<ConnectionEvent>,
    retransmit_after: Duration,
}

impl UdpConnectionCore {
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        types: Arc<TypeRegistry>,
        config: &TempestConfig,
        allocator: Arc<Mutex<MessageIdAllocator>>,
    ) -> Self {
        UdpConnectionCore {
            framer: Framer::new(registry, types, config.max_message_size),
            allocator,
            connection_id: ConnectionId::NONE,
            queue: ReliableQueue::new(),
            assembly: PartialAssembly::new(config.max_message_size),
            pending: PendingAck::new(),
            ack_ids: Vec::new(),
            events: VecDeque::new(),
            retransmit_after: config.retransmit_after,
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

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Messages sent but not yet acknowledged.
    pub fn unacknowledged(&self) -> usize {
        self.pending.len()
    }

    /// Processes one inbound datagram.
    pub fn handle_datagram(
        &mut self,
        data: &[u8],
        now: Instant,
    ) -> std::result::Result<(), ConnectionResult> {
        self.handle_frame(data, now, false)
    }

    fn handle_frame(
        &mut self,
        data: &[u8],
        now: Instant,
        reassembled: bool,
    ) -> std::result::Result<(), ConnectionResult> {
        let mut state = HeaderState::new();
        let poll = self.framer.try_read_header(&mut state, data);
        match poll {
            HeaderPoll::Complete => {}
            HeaderPoll::Invalid(reason) => return Err(reason),
            // A datagram is a complete frame; a short one is garbage.
            HeaderPoll::NeedMore => return Err(ConnectionResult::FailedUnknown),
        }
        let (mut header, message) = state.finish();
        if header.message_len != data.len() {
            return Err(ConnectionResult::FailedUnknown);
        }
        let message = self
            .framer
            .read_payload(&mut header, message, data)
            .map_err(|e| e.disposition())?;
        let raw = (header.protocol_id == INTERNAL_PROTOCOL_ID).then(|| data.to_vec());
        let parsed = Parsed {
            header,
            message,
            raw,
        };

        let reliable = parsed.header.message_id.is_reliable() && !parsed.header.is_response;
        if !reliable || reassembled {
            return self.route(parsed, now);
        }

        let id = parsed.header.message_id;
        match self.queue.enqueue(id, parsed) {
            Enqueue::Released(run) => {
                for (released_id, item) in run {
                    self.ack_ids.push(released_id.0);
                    self.route(item, now)?;
                }
                Ok(())
            }
            Enqueue::Stored => {
                self.ack_ids.push(id.0);
                Ok(())
            }
            // Re-acknowledge duplicates; the peer retransmits until it
            // sees an ack, so the earlier one may have been lost.
            Enqueue::Duplicate => {
                self.ack_ids.push(id.0);
                Ok(())
            }
            Enqueue::Rejected => Ok(()),
        }
    }

    fn route(
        &mut self,
        parsed: Parsed,
        now: Instant,
    ) -> std::result::Result<(), ConnectionResult> {
        if parsed.header.protocol_id == INTERNAL_PROTOCOL_ID {
            match parsed.header.message_type {
                control::ACKNOWLEDGE => {
                    if let Some(ack) = downcast::<AcknowledgeMessage>(parsed.message) {
                        let cleared = self.pending.acknowledge(&ack.message_ids);
                        trace!(acknowledged = cleared, "cleared pending messages");
                    }
                    return Ok(());
                }
                control::PARTIAL => {
                    if let Some(fragment) = downcast::<PartialMessage>(parsed.message)
                        && let Some(frame) = self.assembly.add(*fragment)
                    {
                        return self.handle_frame(&frame, now, true);
                    }
                    return Ok(());
                }
                _ => {}
            }
        }
        self.events.push_back(ConnectionEvent::Message {
            header: parsed.header,
            message: parsed.message,
            raw: parsed.raw,
        });
        Ok(())
    }

    /// Frames an outbound message into one or more datagrams,
    /// fragmenting past the payload budget and registering reliable
    /// frames for retransmission.
    pub fn frame_outbound(
        &mut self,
        message: &dyn Message,
        frame_id: FrameId,
        now: Instant,
    ) -> Result<Vec<Vec<u8>>> {
        let (id, is_response) = match frame_id {
            FrameId::Fresh(id) => (id, false),
            FrameId::ResponseTo(id) => (id, true),
            FrameId::Unreliable => (MessageId::UNRELIABLE, false),
        };
        let frame = self
            .framer
            .frame(message, self.connection_id, id, is_response)?;
        let reliable = id.is_reliable() && !is_response;

        if !partial::needs_fragmenting(&frame) {
            if reliable {
                self.pending.insert(id, frame.clone(), now);
            }
            return Ok(vec![frame]);
        }

        if !reliable {
            // Nothing would retransmit a lost piece.
            return Err(Error::MessageTooLarge {
                size: frame.len(),
                max: UDP_FRAGMENT_PAYLOAD,
            });
        }

        let fragments = partial::fragment(&frame, id);
        let mut datagrams = Vec::with_capacity(fragments.len());
        for (index, fragment) in fragments.into_iter().enumerate() {
            // The first fragment keeps the original id so the peer's
            // ack lands in the original pending slot.
            let fragment_id = if index == 0 {
                id
            } else {
                self.allocator.lock().allocate()
            };
            let datagram =
                self.framer
                    .frame(&fragment, self.connection_id, fragment_id, false)?;
            self.pending.insert(fragment_id, datagram.clone(), now);
            datagrams.push(datagram);
        }
        debug!(
            id = id.0,
            fragments = datagrams.len(),
            "fragmented oversized message"
        );
        Ok(datagrams)
    }

    /// Registers an externally framed reliable frame (the handshake's
    /// signed step) for retransmission, reading the id off the wire.
    pub fn register_pending_raw(&mut self, frame: &[u8], now: Instant) {
        if frame.len() < BASE_HEADER_LEN {
            return;
        }
        let word = i32::from_le_bytes(
            frame[BASE_HEADER_LEN - 4..BASE_HEADER_LEN]
                .try_into()
                .expect("4 bytes"),
        );
        let (id, is_response) = MessageHeader::unpack_message_id(word);
        if id.is_reliable() && !is_response {
            self.pending.insert(id, frame.to_vec(), now);
        }
    }

    /// Drains accumulated acknowledgements into a single frame. Called
    /// after inbound routing so a `Connect` is never acknowledged
    /// before it has been fully processed.
    pub fn take_ack_frame(&mut self) -> Option<Vec<u8>> {
        if self.ack_ids.is_empty() {
            return None;
        }
        let ack = AcknowledgeMessage {
            message_ids: std::mem::take(&mut self.ack_ids),
        };
        match self
            .framer
            .frame(&ack, self.connection_id, MessageId::UNRELIABLE, false)
        {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(error = %e, "failed to frame acknowledgement");
                None
            }
        }
    }

    /// Frames overdue for acknowledgement, re-sent with their original
    /// ids. Driven by the provider's delivery timer.
    pub fn retransmit_tick(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let due = self.pending.take_due(now, self.retransmit_after);
        if !due.is_empty() {
            debug!(count = due.len(), "retransmitting unacknowledged messages");
        }
        due.into_iter().map(|(_, frame)| frame).collect()
    }
}

impl std::fmt::Debug for UdpConnectionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpConnectionCore")
            .field("connection_id", &self.connection_id)
            .field("pending", &self.pending.len())
            .field("parked", &self.queue.pending())
            .finish_non_exhaustive()
    }
}

impl routing::ConnectionCore for UdpConnectionCore {
    fn set_connection_id(&mut self, id: ConnectionId) {
        UdpConnectionCore::set_connection_id(self, id)
    }

    fn install_crypto(&mut self, crypto: Arc<Mutex<SessionCrypto>>) {
        UdpConnectionCore::install_crypto(self, crypto)
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
        let id = self.allocator.lock().allocate();
        self.framer
            .frame_with_key(message, self.connection_id, id, key, hash)
    }
}

/// Bounded pool of reusable send buffers. Acquisition waits when every
/// buffer is in flight, bounding memory under send pressure.
struct SendPool {
    permits: Arc<Semaphore>,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl SendPool {
    fn new(limit: usize) -> Arc<Self> {
        Arc::new(SendPool {
            permits: Arc::new(Semaphore::new(limit.max(1))),
            buffers: Mutex::new(Vec::new()),
        })
    }

    async fn acquire(self: &Arc<Self>) -> Vec<u8> {
        let permit = self.permits.clone().acquire_owned().await;
        // The semaphore is never closed while the pool is alive.
        permit.expect("send pool semaphore closed").forget();
        self.buffers
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(UDP_FRAGMENT_PAYLOAD + 128))
    }

    fn release(self: &Arc<Self>, mut buffer: Vec<u8>) {
        buffer.clear();
        self.buffers.lock().push(buffer);
        self.permits.add_permits(1);
    }
}

/// Where a connection's datagrams go.
enum UdpTarget {
    /// The socket is `connect`ed to the peer (client side).
    Connected,
    /// Explicit address on a shared provider socket (server side).
    Addr(SocketAddr),
}

async fn udp_send(
    socket: &UdpSocket,
    target: &UdpTarget,
    frame: &[u8],
) -> std::io::Result<usize> {
    match target {
        UdpTarget::Connected => socket.send(frame).await,
        UdpTarget::Addr(addr) => socket.send_to(frame, *addr).await,
    }
}

async fn udp_send_loop(
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    socket: Arc<UdpSocket>,
    target: UdpTarget,
    core: Arc<Mutex<UdpConnectionCore>>,
    pool: Arc<SendPool>,
) {
    while let Some(outbound) = rx.recv().await {
        let frames = match outbound {
            Outbound::Message { message, frame_id } => {
                match core
                    .lock()
                    .frame_outbound(&*message, frame_id, Instant::now())
                {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!(error = %e, "failed to frame outbound message");
                        continue;
                    }
                }
            }
            Outbound::Raw(frame) => {
                core.lock().register_pending_raw(&frame, Instant::now());
                vec![frame]
            }
            Outbound::Close => break,
        };
        for frame in frames {
            let mut buffer = pool.acquire().await;
            buffer.extend_from_slice(&frame);
            // Send errors are dropped: unreliable frames are
            // fire-and-forget, reliable ones retry off the pending set.
            if let Err(e) = udp_send(&socket, &target, &buffer).await {
                trace!(error = %e, "datagram send failed");
            }
            pool.release(buffer);
        }
    }
}

/// Periodic delivery timer: re-sends unacknowledged frames.
async fn retransmit_loop(
    socket: Arc<UdpSocket>,
    target: UdpTarget,
    core: Arc<Mutex<UdpConnectionCore>>,
    shared: Arc<Shared>,
    scan: Duration,
) {
    let mut ticker = tokio::time::interval(scan);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if *shared.state.lock() == ConnectionState::Disconnected {
            break;
        }
        let due = core.lock().retransmit_tick(Instant::now());
        for frame in due {
            if let Err(e) = udp_send(&socket, &target, &frame).await {
                trace!(error = %e, "retransmit send failed");
            }
        }
    }
}

/// Options for an outbound UDP client connection.
pub struct UdpClientOptions {
    pub registry: Arc<ProtocolRegistry>,
    pub types: Arc<TypeRegistry>,
    pub config: TempestConfig,
    /// The client's identity key; must hold the private half.
    pub auth_key: Arc<dyn AuthKey>,
    pub dispatcher: Arc<Dispatcher>,
    /// Seedable randomness for tests; defaults to OS entropy.
    pub rng: Option<StdRng>,
}

/// An established client connection over UDP.
pub struct UdpConnection {
    shared: Arc<Shared>,
    closed: watch::Receiver<Option<DisconnectInfo>>,
}

impl UdpConnection {
    /// Binds an ephemeral socket, runs the handshake reliably, and
    /// resolves once `Connected` arrives.
    pub async fn connect(server: SocketAddr, options: UdpClientOptions) -> Result<Self> {
        let UdpClientOptions {
            registry,
            types,
            config,
            auth_key,
            dispatcher,
            rng,
        } = options;
        let rng = rng.unwrap_or_else(StdRng::from_entropy);

        let bind_addr: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal address")
        } else {
            "[::]:0".parse().expect("literal address")
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        socket.connect(server).await?;

        let allocator = Arc::new(Mutex::new(MessageIdAllocator::new()));
        let core = Arc::new(Mutex::new(UdpConnectionCore::new(
            registry.clone(),
            types,
            &config,
            allocator.clone(),
        )));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let tx = ConnectionTx::new(out_tx, allocator, true);
        let (closed_tx, closed_rx) = watch::channel(None);
        let shared = Arc::new(Shared::new(config, ConnectionId::NONE, tx, closed_tx));
        let pool = SendPool::new(shared.config.send_pool_limit);

        tokio::spawn(udp_send_loop(
            out_rx,
            socket.clone(),
            UdpTarget::Connected,
            core.clone(),
            pool,
        ));
        tokio::spawn(retransmit_loop(
            socket.clone(),
            UdpTarget::Connected,
            core.clone(),
            shared.clone(),
            shared.config.retransmit_scan,
        ));

        let mut handshake = HandshakeClient::new(
            registry,
            auth_key,
            shared.config.allowed_hashes.clone(),
            rng,
        );
        let connect = handshake.start()?;
        shared.tx.send(Box::new(connect))?;

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(client_recv_loop(
            socket,
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
            Ok(Ok(())) => Ok(UdpConnection {
                shared,
                closed: closed_rx,
            }),
            Ok(Err(_)) => {
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

    pub fn remote_key(&self) -> Option<Arc<dyn AuthKey>> {
        self.shared.remote_key.lock().clone()
    }

    pub fn response_time(&self) -> Option<Duration> {
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
        timeout: Option<Duration>,
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

impl std::fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpConnection")
            .field("connection_id", &self.connection_id())
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn client_recv_loop(
    socket: Arc<UdpSocket>,
    core: Arc<Mutex<UdpConnectionCore>>,
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
    mut phase: Phase,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "socket receive failed");
                finish(&shared, ConnectionResult::ConnectionFailed, None, false);
                break;
            }
        };
        if let Err(reason) = core.lock().handle_datagram(&buf[..n], Instant::now()) {
            finish(&shared, reason, None, true);
            break;
        }
        let alive = routing::drain_events(
            &core,
            &shared,
            &dispatcher,
            &mut phase,
            UdpConnectionCore::poll_event,
        );
        // Acknowledge only after everything released has been routed.
        let ack = core.lock().take_ack_frame();
        if let Some(ack) = ack
            && let Err(e) = socket.send(&ack).await
        {
            trace!(error = %e, "acknowledgement send failed");
        }
        if !alive || *shared.state.lock() == ConnectionState::Disconnected {
            break;
        }
    }
}

/// One logical peer tracked by a provider.
struct UdpPeer {
    core: Arc<Mutex<UdpConnectionCore>>,
    shared: Arc<Shared>,
    phase: Mutex<Phase>,
    remote_addr: SocketAddr,
}

struct ProviderCtx {
    registry: Arc<ProtocolRegistry>,
    types: Arc<TypeRegistry>,
    config: TempestConfig,
    auth_key: Arc<RsaAuthKey>,
    enc_key: Arc<RsaAuthKey>,
    dispatcher: Arc<Dispatcher>,
    on_connection: Option<ConnectionMade>,
    peers: Mutex<HashMap<i32, Arc<UdpPeer>>>,
    next_id: AtomicI32,
    rng: Mutex<StdRng>,
    /// Framer used to peek connectionless datagrams before any
    /// connection exists.
    probe: Framer,
    /// Send buffers shared by every peer of this provider.
    pool: Arc<SendPool>,
}

/// Options for a listening UDP provider.
pub struct UdpServerOptions {
    pub registry: Arc<ProtocolRegistry>,
    pub types: Arc<TypeRegistry>,
    pub config: TempestConfig,
    pub auth_key: Arc<RsaAuthKey>,
    pub enc_key: Option<Arc<RsaAuthKey>>,
    pub dispatcher: Arc<Dispatcher>,
    pub on_connection: Option<ConnectionMade>,
    pub rng: Option<StdRng>,
}

/// A bound UDP provider: accepts connectionless `Connect` datagrams
/// and multiplexes established connections over its sockets.
pub struct UdpProvider {
    local_addrs: Vec<SocketAddr>,
    ctx: Arc<ProviderCtx>,
    shutdown: watch::Sender<bool>,
}

impl UdpProvider {
    /// Binds one socket per address (typically an IPv4/IPv6 pair) and
    /// starts a receive loop per address family.
    pub async fn bind(addrs: &[SocketAddr], options: UdpServerOptions) -> Result<Self> {
        let UdpServerOptions {
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
        let rng = rng.unwrap_or_else(StdRng::from_entropy);

        let probe = Framer::new(registry.clone(), types.clone(), config.max_message_size);
        let pool = SendPool::new(config.send_pool_limit);
        let ctx = Arc::new(ProviderCtx {
            registry,
            types,
            config,
            auth_key,
            enc_key,
            dispatcher,
            on_connection,
            peers: Mutex::new(HashMap::new()),
            next_id: AtomicI32::new(1),
            rng: Mutex::new(rng),
            probe,
            pool,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut local_addrs = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let socket = Arc::new(UdpSocket::bind(addr).await?);
            local_addrs.push(socket.local_addr()?);
            let ctx = ctx.clone();
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let received = tokio::select! {
                        _ = shutdown.changed() => break,
                        received = socket.recv_from(&mut buf) => received,
                    };
                    let (n, addr) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "socket receive failed");
                            continue;
                        }
                    };
                    provider_datagram(&socket, &ctx, &buf[..n], addr).await;
                }
            });
        }

        // Provider-wide ping and delivery timers.
        {
            let ctx = ctx.clone();
            let mut shutdown = shutdown_rx;
            tokio::spawn(async move {
                let mut ping = tokio::time::interval(ctx.config.ping_interval);
                ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ping.tick() => {}
                    }
                    let snapshot: Vec<(i32, Arc<UdpPeer>)> = ctx
                        .peers
                        .lock()
                        .iter()
                        .map(|(id, peer)| (*id, peer.clone()))
                        .collect();
                    for (id, peer) in snapshot {
                        if !peer.shared.state.lock().is_connected() {
                            continue;
                        }
                        if peer.shared.monitor.lock().timed_out() {
                            debug!(connection_id = id, "peer missed two pings");
                            finish(&peer.shared, ConnectionResult::TimedOut, None, true);
                            ctx.peers.lock().remove(&id);
                            continue;
                        }
                        peer.shared.monitor.lock().on_ping_sent(Instant::now());
                        let _ = peer.shared.tx.send(Box::new(PingMessage {
                            interval: ctx.config.ping_interval,
                        }));
                    }
                }
            });
        }

        Ok(UdpProvider {
            local_addrs,
            ctx,
            shutdown: shutdown_tx,
        })
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn connection_count(&self) -> usize {
        self.ctx.peers.lock().len()
    }

    /// Round-trip time measured against one peer by the ping timer.
    pub fn response_time(&self, connection_id: ConnectionId) -> Option<Duration> {
        self.ctx
            .peers
            .lock()
            .get(&connection_id.0)
            .and_then(|peer| peer.shared.monitor.lock().response_time())
    }

    /// Stops the receive loops and disconnects every peer gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let peers: Vec<Arc<UdpPeer>> = self.ctx.peers.lock().values().cloned().collect();
        for peer in peers {
            finish(&peer.shared, ConnectionResult::Success, None, true);
        }
        self.ctx.peers.lock().clear();
    }
}

impl std::fmt::Debug for UdpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpProvider")
            .field("local_addrs", &self.local_addrs)
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// Demultiplexes one datagram arriving at a provider socket.
async fn provider_datagram(
    socket: &Arc<UdpSocket>,
    ctx: &Arc<ProviderCtx>,
    data: &[u8],
    from: SocketAddr,
) {
    if data.len() < BASE_HEADER_LEN {
        trace!(%from, "runt datagram");
        return;
    }
    let connection_id = i32::from_le_bytes(data[1..5].try_into().expect("4 bytes"));
    if connection_id == 0 {
        connectionless_datagram(socket, ctx, data, from).await;
        return;
    }
    let peer = ctx.peers.lock().get(&connection_id).cloned();
    let Some(peer) = peer else {
        trace!(connection_id, %from, "datagram for unknown connection");
        return;
    };
    if peer.remote_addr != from {
        trace!(connection_id, %from, "datagram from unexpected address");
        return;
    }
    peer_datagram(socket, ctx, &peer, connection_id, data).await;
}

/// Runs one datagram through a peer's core, routes the results, and
/// acknowledges afterwards.
async fn peer_datagram(
    socket: &Arc<UdpSocket>,
    ctx: &Arc<ProviderCtx>,
    peer: &Arc<UdpPeer>,
    connection_id: i32,
    data: &[u8],
) {
    if let Err(reason) = peer.core.lock().handle_datagram(data, Instant::now()) {
        finish(&peer.shared, reason, None, true);
        ctx.peers.lock().remove(&connection_id);
        return;
    }
    let alive = {
        let mut phase = peer.phase.lock();
        routing::drain_events(
            &peer.core,
            &peer.shared,
            &ctx.dispatcher,
            &mut phase,
            UdpConnectionCore::poll_event,
        )
    };
    let ack = peer.core.lock().take_ack_frame();
    if let Some(ack) = ack
        && let Err(e) = socket.send_to(&ack, peer.remote_addr).await
    {
        trace!(error = %e, "acknowledgement send failed");
    }
    if !alive {
        ctx.peers.lock().remove(&connection_id);
    }
}

/// Handles a datagram with connection id 0: only messages accepted
/// connectionlessly are considered, and only `Connect` creates state.
async fn connectionless_datagram(
    socket: &Arc<UdpSocket>,
    ctx: &Arc<ProviderCtx>,
    data: &[u8],
    from: SocketAddr,
) {
    let mut state = HeaderState::new();
    match ctx.probe.try_read_header(&mut state, data) {
        HeaderPoll::Complete => {}
        _ => {
            trace!(%from, "unparseable connectionless datagram");
            return;
        }
    }
    let (header, _message) = state.finish();
    if !header.flags.accepted_connectionlessly {
        trace!(%from, "connectionless datagram for connection-bound type");
        return;
    }
    if header.protocol_id != INTERNAL_PROTOCOL_ID || header.message_type != control::CONNECT {
        trace!(%from, "ignoring connectionless non-connect datagram");
        return;
    }
    if ctx.peers.lock().len() >= ctx.config.max_connections {
        debug!(%from, "at connection limit, ignoring connect");
        return;
    }

    let connection_id = allocate_connection_id(ctx);
    let allocator = Arc::new(Mutex::new(MessageIdAllocator::new()));
    let mut core_inner = UdpConnectionCore::new(
        ctx.registry.clone(),
        ctx.types.clone(),
        &ctx.config,
        allocator.clone(),
    );
    core_inner.set_connection_id(connection_id);
    let core = Arc::new(Mutex::new(core_inner));

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let tx = ConnectionTx::new(out_tx, allocator, true);
    let (closed_tx, _) = watch::channel(None);
    let shared = Arc::new(Shared::new(ctx.config.clone(), connection_id, tx, closed_tx));

    let connection_rng = StdRng::seed_from_u64(ctx.rng.lock().next_u64());
    let handshake = Box::new(HandshakeServer::new(
        ctx.registry.clone(),
        ctx.auth_key.clone(),
        ctx.enc_key.clone(),
        ctx.config.allowed_hashes.clone(),
        connection_id,
        connection_rng,
    ));

    let peer = Arc::new(UdpPeer {
        core: core.clone(),
        shared: shared.clone(),
        phase: Mutex::new(Phase::ServerHandshake {
            handshake,
            on_connection: ctx.on_connection.clone(),
            peer_addr: from,
        }),
        remote_addr: from,
    });
    ctx.peers.lock().insert(connection_id.0, peer.clone());
    debug!(connection_id = connection_id.0, %from, "new pending udp connection");

    tokio::spawn(udp_send_loop(
        out_rx,
        socket.clone(),
        UdpTarget::Addr(from),
        core.clone(),
        ctx.pool.clone(),
    ));
    tokio::spawn(retransmit_loop(
        socket.clone(),
        UdpTarget::Addr(from),
        core,
        shared,
        ctx.config.retransmit_scan,
    ));

    // Feed the connect through the new peer so the reliable machinery
    // sees and acknowledges it.
    peer_datagram(socket, ctx, &peer, connection_id.0, data).await;
}

/// Monotonically increasing non-zero connection ids, checked unique
/// against the live set.
fn allocate_connection_id(ctx: &ProviderCtx) -> ConnectionId {
    loop {
        let id = ctx.next_id.fetch_add(1, Ordering::Relaxed);
        if id <= 0 {
            ctx.next_id.store(1, Ordering::Relaxed);
            continue;
        }
        if !ctx.peers.lock().contains_key(&id) {
            return ConnectionId(id);
        }
    }
}
