//! Handler registry and the two execution-ordering modes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::message::{ConnectionId, Message, MessageHeader, MessageId};
use crate::reliable::MessageIdAllocator;

/// The id a queued message will be framed with.
#[derive(Debug, Clone, Copy)]
pub enum FrameId {
    /// A fresh reliable id, allocated at enqueue time so the write
    /// order matches the allocation order the peer's replay guard
    /// expects.
    Fresh(MessageId),
    /// A response paired to an inbound id.
    ResponseTo(MessageId),
    /// Id 0: fire-and-forget on datagram transports.
    Unreliable,
}

/// An outbound request queued to a connection's send loop.
pub enum Outbound {
    Message {
        message: Box<dyn Message>,
        frame_id: FrameId,
    },
    /// Pre-framed bytes, used by the handshake for its signed step.
    Raw(Vec<u8>),
    /// Drain point: the send loop shuts the socket down after this.
    Close,
}

/// Send-side handle of one connection: the outbound queue plus the id
/// allocator shared with the connection core.
#[derive(Clone)]
pub struct ConnectionTx {
    tx: mpsc::UnboundedSender<Outbound>,
    allocator: Arc<Mutex<MessageIdAllocator>>,
    /// Datagram transports leave unreliable messages at id 0; stream
    /// transports number every message for the replay guard.
    datagram: bool,
}

impl ConnectionTx {
    pub fn new(
        tx: mpsc::UnboundedSender<Outbound>,
        allocator: Arc<Mutex<MessageIdAllocator>>,
        datagram: bool,
    ) -> Self {
        ConnectionTx {
            tx,
            allocator,
            datagram,
        }
    }

    /// Queues a message, returning the id it will travel under.
    ///
    /// Allocation and enqueueing happen under one lock so the write
    /// order always matches the id order.
    pub fn send(&self, message: Box<dyn Message>) -> Result<MessageId> {
        let mut allocator = self.allocator.lock();
        let frame_id = if self.datagram && !message.flags().reliable() {
            FrameId::Unreliable
        } else {
            FrameId::Fresh(allocator.allocate())
        };
        let id = match frame_id {
            FrameId::Fresh(id) => id,
            _ => MessageId::UNRELIABLE,
        };
        self.tx
            .send(Outbound::Message { message, frame_id })
            .map_err(|_| Error::NotConnected("connection closed"))?;
        Ok(id)
    }

    /// Queues a message and registers a response future for its id
    /// before the frame can possibly be written, so a fast peer cannot
    /// answer an unregistered id.
    pub fn send_expecting(
        &self,
        message: Box<dyn Message>,
        responses: &crate::responses::ResponseManager,
        timeout: Option<std::time::Duration>,
    ) -> Result<crate::responses::ResponseFuture> {
        let mut allocator = self.allocator.lock();
        let id = allocator.allocate();
        let future = responses.register(id, timeout);
        self.tx
            .send(Outbound::Message {
                message,
                frame_id: FrameId::Fresh(id),
            })
            .map_err(|_| Error::NotConnected("connection closed"))?;
        Ok(future)
    }

    /// Queues a response paired to an inbound message id.
    pub fn respond(&self, original: MessageId, message: Box<dyn Message>) -> Result<()> {
        self.tx
            .send(Outbound::Message {
                message,
                frame_id: FrameId::ResponseTo(original),
            })
            .map_err(|_| Error::NotConnected("connection closed"))
    }

    /// Queues pre-framed bytes.
    pub fn raw(&self, bytes: Vec<u8>) -> Result<()> {
        self.tx
            .send(Outbound::Raw(bytes))
            .map_err(|_| Error::NotConnected("connection closed"))
    }

    /// Asks the send loop to drain and shut down.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

impl std::fmt::Debug for ConnectionTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTx")
            .field("datagram", &self.datagram)
            .finish()
    }
}

/// An inbound message as handlers see it.
pub struct MessageEvent {
    pub connection_id: ConnectionId,
    pub header: MessageHeader,
    pub message: Box<dyn Message>,
    outbound: ConnectionTx,
}

impl MessageEvent {
    pub fn new(
        connection_id: ConnectionId,
        header: MessageHeader,
        message: Box<dyn Message>,
        outbound: ConnectionTx,
    ) -> Self {
        MessageEvent {
            connection_id,
            header,
            message,
            outbound,
        }
    }

    /// Sends a message back on the originating connection.
    pub fn send(&self, message: Box<dyn Message>) -> Result<MessageId> {
        self.outbound.send(message)
    }

    /// Sends a response paired to this event's message id.
    pub fn respond(&self, message: Box<dyn Message>) -> Result<()> {
        self.outbound.respond(self.header.message_id, message)
    }

    /// Takes the event apart, handing the handler ownership of the
    /// message alongside the send handle for the connection.
    pub fn split(self) -> (ConnectionId, MessageHeader, Box<dyn Message>, ConnectionTx) {
        (
            self.connection_id,
            self.header,
            self.message,
            self.outbound,
        )
    }
}

impl std::fmt::Debug for MessageEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageEvent")
            .field("connection_id", &self.connection_id)
            .field("protocol", &self.header.protocol_id)
            .field("message_type", &self.header.message_type)
            .field("message_id", &self.header.message_id)
            .finish()
    }
}

/// How handler invocations are ordered across connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Each connection pumps its own messages: handlers for one
    /// connection run sequentially, different connections in parallel.
    #[default]
    PerConnection,
    /// All connections feed one queue drained by a single consumer;
    /// handlers observe one total order matching arrival.
    GlobalOrder,
}

pub type Handler = Arc<dyn Fn(MessageEvent) + Send + Sync>;

/// Registry of `(protocol, message type)` handlers shared by every
/// connection of a provider.
pub struct Dispatcher {
    handlers: RwLock<HashMap<(u8, u16), Handler>>,
    mode: ExecutionMode,
    global: RwLock<Option<mpsc::UnboundedSender<MessageEvent>>>,
}

impl Dispatcher {
    pub fn new(mode: ExecutionMode) -> Arc<Self> {
        let dispatcher = Arc::new(Dispatcher {
            handlers: RwLock::new(HashMap::new()),
            mode,
            global: RwLock::new(None),
        });
        if mode == ExecutionMode::GlobalOrder {
            let (tx, rx) = mpsc::unbounded_channel();
            *dispatcher.global.write() = Some(tx);
            let consumer = dispatcher.clone();
            tokio::spawn(consumer.drain_global(rx));
        }
        dispatcher
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn register<F>(&self, protocol_id: u8, message_type: u16, handler: F)
    where
        F: Fn(MessageEvent) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .insert((protocol_id, message_type), Arc::new(handler));
    }

    /// Routes one inbound event. In per-connection mode the handler
    /// runs on the caller, preserving the connection's arrival order;
    /// in global mode the event is queued behind every other
    /// connection's traffic.
    pub fn dispatch(&self, event: MessageEvent) {
        match self.mode {
            ExecutionMode::PerConnection => self.invoke(event),
            ExecutionMode::GlobalOrder => {
                let global = self.global.read();
                if let Some(tx) = global.as_ref() {
                    if tx.send(event).is_err() {
                        warn!("global dispatch consumer is gone, dropping message");
                    }
                }
            }
        }
    }

    fn invoke(&self, event: MessageEvent) {
        let key = (event.header.protocol_id, event.header.message_type);
        let handler = self.handlers.read().get(&key).cloned();
        match handler {
            Some(handler) => handler(event),
            None => {
                trace!(
                    protocol = key.0,
                    message_type = key.1,
                    "no handler registered for inbound message"
                );
            }
        }
    }

    async fn drain_global(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<MessageEvent>) {
        while let Some(event) = rx.recv().await {
            self.invoke(event);
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("mode", &self.mode)
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}
