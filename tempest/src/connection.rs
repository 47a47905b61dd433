//! Connection lifecycle state, the state shared between a connection's
//! tasks, and the inbound replay/ordering guard.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::config::TempestConfig;
use crate::control::DisconnectMessage;
use crate::crypto::AuthKey;
use crate::dispatch::ConnectionTx;
use crate::error::ConnectionResult;
use crate::message::{ConnectionId, Message, MessageHeader, MessageId};
use crate::ping::ActivityMonitor;
use crate::responses::ResponseManager;

/// Lifecycle of a connection, advanced only forward except for reuse
/// after `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// Events a connection surfaces to its driver and, through it, the
/// application.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The handshake completed and the connection is live.
    Connected(crate::message::ConnectionId),
    /// A fully parsed inbound message.
    Message {
        header: MessageHeader,
        message: Box<dyn Message>,
        /// Raw frame bytes, kept for control messages whose signatures
        /// are verified above the framer.
        raw: Option<Vec<u8>>,
    },
    /// The connection ended with the given reason.
    Disconnected {
        reason: ConnectionResult,
        custom_text: Option<String>,
    },
}

/// Terminal reason and optional custom text of a closed connection.
pub type DisconnectInfo = (ConnectionResult, Option<String>);

/// State shared between a connection's driver tasks and its handle.
pub(crate) struct Shared {
    pub config: TempestConfig,
    pub state: Mutex<ConnectionState>,
    pub connection_id: Mutex<ConnectionId>,
    pub remote_key: Mutex<Option<Arc<dyn AuthKey>>>,
    pub monitor: Mutex<ActivityMonitor>,
    pub responses: ResponseManager,
    pub tx: ConnectionTx,
    pub closed: watch::Sender<Option<DisconnectInfo>>,
}

impl Shared {
    pub fn new(
        config: TempestConfig,
        connection_id: ConnectionId,
        tx: ConnectionTx,
        closed: watch::Sender<Option<DisconnectInfo>>,
    ) -> Self {
        Shared {
            config,
            state: Mutex::new(ConnectionState::Handshaking),
            connection_id: Mutex::new(connection_id),
            remote_key: Mutex::new(None),
            monitor: Mutex::new(ActivityMonitor::new()),
            responses: ResponseManager::new(),
            tx,
            closed,
        }
    }
}

/// Idempotent teardown: flips the state, optionally tells the peer
/// why, cancels response futures and releases waiters.
pub(crate) fn finish(
    shared: &Shared,
    reason: ConnectionResult,
    text: Option<String>,
    notify_peer: bool,
) {
    {
        let mut state = shared.state.lock();
        if *state == ConnectionState::Disconnected {
            return;
        }
        *state = ConnectionState::Disconnected;
    }
    debug!(?reason, "connection finished");
    if notify_peer {
        let _ = shared.tx.send(Box::new(DisconnectMessage {
            reason,
            custom_text: text.clone(),
        }));
    }
    shared.tx.close();
    shared.responses.cancel_all();
    let _ = shared.closed.send(Some((reason, text)));
}

/// Ordering guard for stream transports.
///
/// Inbound non-response ids must advance strictly (modulo the wrapping
/// id space); inbound response ids must refer to an id the local side
/// has already allocated. Either violation is indistinguishable from a
/// replay and fails the connection.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    last_inbound: MessageId,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_inbound(&self) -> MessageId {
        self.last_inbound
    }

    /// Checks one inbound header. `next_outbound` is the local
    /// allocator's upcoming id, bounding which response ids are
    /// plausible.
    pub fn check(
        &mut self,
        header: &MessageHeader,
        next_outbound: MessageId,
    ) -> Result<(), ConnectionResult> {
        if header.is_response {
            // A response to an id we have not allocated yet cannot be
            // legitimate.
            if header.message_id == next_outbound || header.message_id.is_after(next_outbound) {
                return Err(ConnectionResult::MessageAuthenticationFailed);
            }
            return Ok(());
        }
        if !header.message_id.is_reliable() || !header.message_id.is_after(self.last_inbound) {
            return Err(ConnectionResult::MessageAuthenticationFailed);
        }
        self.last_inbound = header.message_id;
        Ok(())
    }
}
