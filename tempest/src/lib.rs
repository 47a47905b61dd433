//! # Tempest
//!
//! A message-oriented networking library: applications exchange typed
//! messages over heterogeneous transports (TCP streams, UDP datagrams)
//! with optional authenticated encryption behind a single
//! message-handling surface.
//!
//! The pieces, bottom up:
//!
//! - [`protocol`]: versioned protocol identities and message factories.
//! - [`message`]: the [`Message`](message::Message) trait, flags and
//!   header model.
//! - [`framer`]: frame construction and the incremental header parser,
//!   including the encryption and signing envelopes.
//! - [`crypto`]: AES-256-CBC + HMAC-SHA256 session state and the RSA
//!   handshake keys.
//! - [`handshake`]: the three-message mutual authentication exchange.
//! - [`reliable`] / [`partial`]: in-order release, acknowledgement,
//!   retransmission and fragmentation for datagram transports.
//! - [`tcp`] / [`udp`]: sans-io connection cores with tokio drivers.
//! - [`dispatch`] / [`responses`]: handler registry, execution-ordering
//!   modes and request/response pairing.
//!
//! Protocol and type registries are explicit handles; nothing in the
//! crate is process-global, so independent stacks (and tests) can
//! coexist in one process.

pub mod config;
pub mod connection;
pub mod control;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod framer;
pub mod handshake;
pub mod message;
pub mod partial;
pub mod ping;
pub mod protocol;
pub mod reliable;
pub mod responses;
mod routing;
pub mod tcp;
pub mod udp;

pub use config::TempestConfig;
pub use connection::{ConnectionEvent, ConnectionState, DisconnectInfo};
pub use crypto::{AuthKey, RsaAuthKey, SessionCrypto, SigningHash};
pub use dispatch::{ConnectionTx, Dispatcher, ExecutionMode, MessageEvent};
pub use error::{ConnectionResult, Error, Result};
pub use message::{ConnectionId, Message, MessageFlags, MessageHeader, MessageId};
pub use protocol::{Protocol, ProtocolRegistry};
pub use responses::{Response, ResponseFuture};
pub use routing::ConnectionMade;
pub use tcp::{TcpClientOptions, TcpConnection, TcpListenerProvider, TcpServerOptions};
pub use udp::{UdpClientOptions, UdpConnection, UdpProvider, UdpServerOptions};

pub use tempest_proto as proto;
