//! Control-message routing shared by the stream and datagram drivers:
//! handshake driving, keep-alive replies, disconnect propagation and
//! user-message dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use tempest_proto::constants::INTERNAL_PROTOCOL_ID;

use crate::connection::{ConnectionEvent, ConnectionState, Shared, finish};
use crate::control::{self, DisconnectMessage, PingMessage, PongMessage};
use crate::crypto::{AuthKey, SessionCrypto, SigningHash};
use crate::dispatch::{Dispatcher, MessageEvent};
use crate::error::{ConnectionResult, Error, Result};
use crate::framer::{Framer, HeaderPoll, HeaderState};
use crate::handshake::{HandshakeClient, HandshakeServer};
use crate::message::{ConnectionId, Message, downcast};

/// The subset of a transport core the routing layer drives.
pub(crate) trait ConnectionCore: Send {
    fn set_connection_id(&mut self, id: ConnectionId);
    fn install_crypto(&mut self, crypto: Arc<Mutex<SessionCrypto>>);
    fn framer(&self) -> &Framer;
    /// Frames and signs the handshake's final message.
    fn frame_with_key(
        &mut self,
        message: &dyn Message,
        key: &dyn AuthKey,
        hash: SigningHash,
    ) -> Result<Vec<u8>>;
}

/// Which half of the handshake this connection is driving, if any.
pub(crate) enum Phase {
    ClientHandshake {
        handshake: HandshakeClient,
        done: Option<oneshot::Sender<()>>,
    },
    ServerHandshake {
        handshake: Box<HandshakeServer>,
        on_connection: Option<ConnectionMade>,
        peer_addr: SocketAddr,
    },
    Active,
}

/// Callback invoked when a peer completes its handshake; returning
/// `false` rejects the connection with an immediate graceful close.
pub type ConnectionMade = Arc<dyn Fn(ConnectionId, SocketAddr) -> bool + Send + Sync>;

/// Why and how a recv loop must stop.
pub(crate) struct Terminate {
    pub reason: ConnectionResult,
    pub text: Option<String>,
    pub notify_peer: bool,
}

impl Terminate {
    fn handshake_failed() -> Self {
        Terminate {
            reason: ConnectionResult::FailedHandshake,
            text: None,
            notify_peer: true,
        }
    }

    fn from_error(error: &Error) -> Self {
        Terminate {
            reason: error.disposition(),
            text: None,
            notify_peer: true,
        }
    }
}

/// Routes one event from a connection core. An `Err` tells the caller
/// to tear the connection down.
pub(crate) fn handle_event<C: ConnectionCore>(
    event: ConnectionEvent,
    core: &Arc<Mutex<C>>,
    shared: &Arc<Shared>,
    dispatcher: &Arc<Dispatcher>,
    phase: &mut Phase,
) -> std::result::Result<(), Terminate> {
    let ConnectionEvent::Message {
        header,
        message,
        raw,
    } = event
    else {
        return Ok(());
    };

    if header.protocol_id == INTERNAL_PROTOCOL_ID {
        return handle_control(header.message_type, message, raw, core, shared, phase);
    }

    // User traffic is held off until the handshake completes.
    if !matches!(phase, Phase::Active) {
        return Err(Terminate::handshake_failed());
    }

    if header.is_response {
        shared.responses.complete(header, message);
        return Ok(());
    }
    let connection_id = *shared.connection_id.lock();
    dispatcher.dispatch(MessageEvent::new(
        connection_id,
        header,
        message,
        shared.tx.clone(),
    ));
    Ok(())
}

fn handle_control<C: ConnectionCore>(
    message_type: u16,
    message: Box<dyn Message>,
    raw: Option<Vec<u8>>,
    core: &Arc<Mutex<C>>,
    shared: &Arc<Shared>,
    phase: &mut Phase,
) -> std::result::Result<(), Terminate> {
    match message_type {
        control::PING => {
            let _ = shared.tx.send(Box::new(PongMessage {}));
            Ok(())
        }
        control::PONG => {
            shared.monitor.lock().on_pong(Instant::now());
            Ok(())
        }
        control::DISCONNECT => {
            let (reason, text) = downcast::<DisconnectMessage>(message)
                .map(|m| (m.reason, m.custom_text.clone()))
                .unwrap_or((ConnectionResult::FailedUnknown, None));
            Err(Terminate {
                reason,
                text,
                notify_peer: false,
            })
        }
        control::ACKNOWLEDGE_CONNECT | control::CONNECTED => {
            handle_client_handshake(message_type, message, core, shared, phase)
        }
        control::CONNECT | control::FINAL_CONNECT => {
            handle_server_handshake(message_type, message, raw, core, shared, phase)
        }
        other => {
            trace!(message_type = other, "unroutable control message");
            Ok(())
        }
    }
}

fn handle_client_handshake<C: ConnectionCore>(
    message_type: u16,
    message: Box<dyn Message>,
    core: &Arc<Mutex<C>>,
    shared: &Arc<Shared>,
    phase: &mut Phase,
) -> std::result::Result<(), Terminate> {
    let Phase::ClientHandshake { handshake, done } = phase else {
        return Err(Terminate::handshake_failed());
    };
    match message_type {
        control::ACKNOWLEDGE_CONNECT => {
            let Some(ack) = downcast(message) else {
                return Err(Terminate::handshake_failed());
            };
            let (final_connect, key, hash) = handshake
                .on_acknowledge(*ack)
                .map_err(|e| Terminate::from_error(&e))?;
            let connection_id = handshake.connection_id();
            *shared.connection_id.lock() = connection_id;
            let framed = {
                let mut core = core.lock();
                core.set_connection_id(connection_id);
                core.frame_with_key(&final_connect, &*key, hash)
            }
            .map_err(|e| Terminate::from_error(&e))?;
            shared.tx.raw(framed).map_err(|e| Terminate::from_error(&e))?;
            Ok(())
        }
        control::CONNECTED => {
            let Some(connected) = downcast(message) else {
                return Err(Terminate::handshake_failed());
            };
            let complete = handshake
                .on_connected(*connected)
                .map_err(|e| Terminate::from_error(&e))?;
            core.lock().install_crypto(complete.session.clone());
            *shared.remote_key.lock() = Some(complete.remote_key.clone());
            *shared.state.lock() = ConnectionState::Connected;
            if let Some(done) = done.take() {
                let _ = done.send(());
            }
            debug!(connection_id = complete.connection_id.0, "handshake complete");
            *phase = Phase::Active;
            Ok(())
        }
        _ => unreachable!("routed by handle_control"),
    }
}

fn handle_server_handshake<C: ConnectionCore>(
    message_type: u16,
    message: Box<dyn Message>,
    raw: Option<Vec<u8>>,
    core: &Arc<Mutex<C>>,
    shared: &Arc<Shared>,
    phase: &mut Phase,
) -> std::result::Result<(), Terminate> {
    let Phase::ServerHandshake {
        handshake,
        on_connection,
        peer_addr,
    } = phase
    else {
        return Err(Terminate::handshake_failed());
    };
    match message_type {
        control::CONNECT => {
            let Some(connect) = downcast(message) else {
                return Err(Terminate::handshake_failed());
            };
            let ack = handshake
                .on_connect(*connect)
                .map_err(|e| Terminate::from_error(&e))?;
            shared
                .tx
                .send(Box::new(ack))
                .map_err(|e| Terminate::from_error(&e))?;
            Ok(())
        }
        control::FINAL_CONNECT => {
            let Some(final_connect) = downcast(message) else {
                return Err(Terminate::handshake_failed());
            };
            let Some(raw) = raw else {
                return Err(Terminate::handshake_failed());
            };
            // Re-derive the signed region from the raw frame; the
            // signature covers it with the length field zeroed.
            let (region, signature) = {
                let core = core.lock();
                rebuild_signed_parts(core.framer(), &raw)
            }
            .map_err(|e| Terminate::from_error(&e))?;
            let (connected, complete) = handshake
                .on_final_connect(*final_connect, &region, &signature)
                .map_err(|e| Terminate::from_error(&e))?;

            core.lock().install_crypto(complete.session.clone());
            *shared.remote_key.lock() = Some(complete.remote_key.clone());
            shared
                .tx
                .send(Box::new(connected))
                .map_err(|e| Terminate::from_error(&e))?;
            *shared.state.lock() = ConnectionState::Connected;
            debug!(connection_id = complete.connection_id.0, "peer handshake complete");

            let accepted = on_connection
                .as_ref()
                .map(|made| made(complete.connection_id, *peer_addr))
                .unwrap_or(true);
            if !accepted {
                return Err(Terminate {
                    reason: ConnectionResult::Custom,
                    text: Some("connection rejected".to_owned()),
                    notify_peer: true,
                });
            }
            *phase = Phase::Active;
            Ok(())
        }
        _ => unreachable!("routed by handle_control"),
    }
}

/// Parses a final-connect frame far enough to split the signed region
/// from its trailing signature.
fn rebuild_signed_parts(framer: &Framer, frame: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut state = HeaderState::new();
    match framer.try_read_header(&mut state, frame) {
        HeaderPoll::Complete => {}
        _ => return Err(Error::Handshake(ConnectionResult::FailedHandshake)),
    }
    let (header, _message) = state.finish();
    framer.split_signed(&header, frame)
}

/// Drains a core's events through the router, finishing the connection
/// on the first terminal condition. Returns whether the connection is
/// still alive.
pub(crate) fn drain_events<C, E>(
    core: &Arc<Mutex<C>>,
    shared: &Arc<Shared>,
    dispatcher: &Arc<Dispatcher>,
    phase: &mut Phase,
    mut poll: E,
) -> bool
where
    C: ConnectionCore,
    E: FnMut(&mut C) -> Option<ConnectionEvent>,
{
    loop {
        let event = {
            let mut core_guard = core.lock();
            poll(&mut *core_guard)
        };
        let Some(event) = event else { return true };
        if let Err(term) = handle_event(event, core, shared, dispatcher, phase) {
            finish(shared, term.reason, term.text, term.notify_peer);
            return false;
        }
    }
}
