//! Error taxonomy for the Tempest core.
//!
//! Failures are categorised rather than typed: every terminal condition
//! maps onto a [`ConnectionResult`] that travels in disconnect messages
//! and events, so both peers agree on why a connection ended.

use tempest_proto::Error as ProtoError;

/// Terminal disposition of a connection attempt or an established
/// connection. Wire-visible in `Disconnect` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionResult {
    Success = 0,
    ConnectionFailed = 1,
    TimedOut = 2,
    IncompatibleVersion = 3,
    FailedHandshake = 4,
    MessageAuthenticationFailed = 5,
    EncryptionMismatch = 6,
    Custom = 7,
    FailedUnknown = 8,
}

impl ConnectionResult {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => ConnectionResult::Success,
            1 => ConnectionResult::ConnectionFailed,
            2 => ConnectionResult::TimedOut,
            3 => ConnectionResult::IncompatibleVersion,
            4 => ConnectionResult::FailedHandshake,
            5 => ConnectionResult::MessageAuthenticationFailed,
            6 => ConnectionResult::EncryptionMismatch,
            7 => ConnectionResult::Custom,
            8 => ConnectionResult::FailedUnknown,
            _ => return None,
        })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("codec error: {0}")]
    Proto(#[from] ProtoError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol id {0} is reserved")]
    ReservedProtocol(u8),
    #[error("protocol {0} is already registered")]
    DuplicateProtocol(u8),
    #[error("message type {type_id} is already registered on protocol {protocol_id}")]
    DuplicateMessageType { protocol_id: u8, type_id: u16 },
    #[error("unknown protocol id {0}")]
    UnknownProtocol(u8),
    #[error("unknown message type {type_id} on protocol {protocol_id}")]
    UnknownMessageType { protocol_id: u8, type_id: u16 },
    #[error("message exceeds the configured maximum size ({size} > {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("frame rejected: {0:?}")]
    InvalidFrame(ConnectionResult),
    #[error("payload authentication failed")]
    AuthenticationFailed,
    #[error("payload decryption failed")]
    DecryptionFailed,
    #[error("no session key established")]
    NoSessionKey,
    #[error("handshake failed: {0:?}")]
    Handshake(ConnectionResult),
    #[error("key error: {0}")]
    Key(String),
    #[error("connection is not in a state to send ({0})")]
    NotConnected(&'static str),
    #[error("response timed out")]
    Timeout,
    #[error("response cancelled by connection teardown")]
    Cancelled,
    #[error("connection limit reached")]
    ConnectionLimit,
}

impl Error {
    /// The disposition a connection should disconnect with when this
    /// error surfaces while processing inbound traffic.
    pub fn disposition(&self) -> ConnectionResult {
        match self {
            Error::Proto(_) => ConnectionResult::FailedUnknown,
            Error::Io(_) => ConnectionResult::ConnectionFailed,
            Error::InvalidFrame(r) | Error::Handshake(r) => *r,
            Error::AuthenticationFailed | Error::DecryptionFailed => {
                ConnectionResult::MessageAuthenticationFailed
            }
            Error::NoSessionKey => ConnectionResult::EncryptionMismatch,
            Error::Timeout => ConnectionResult::TimedOut,
            _ => ConnectionResult::FailedUnknown,
        }
    }
}
