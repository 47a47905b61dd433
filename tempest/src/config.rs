//! Tunables carried by providers and connections.

use std::time::Duration;

use tempest_proto::constants::{DEFAULT_MAX_MESSAGE_SIZE, TCP_RECV_BUFFER_LEN};

use crate::crypto::SigningHash;

/// Configuration shared by every connection of a provider or client.
#[derive(Debug, Clone)]
pub struct TempestConfig {
    /// Hard cap on a single framed message, inbound and outbound.
    pub max_message_size: usize,
    /// Listener stops accepting past this many live connections.
    pub max_connections: usize,
    /// Cadence of provider pings to active connections.
    pub ping_interval: Duration,
    /// Default deadline for `send_for` response futures.
    pub response_timeout: Duration,
    /// How often the delivery timer scans for unacknowledged messages.
    pub retransmit_scan: Duration,
    /// Age at which an unacknowledged message is re-sent.
    pub retransmit_after: Duration,
    /// Initial TCP receive buffer size; grows for oversized frames.
    pub recv_buffer_len: usize,
    /// Bound on the UDP send-buffer pool.
    pub send_pool_limit: usize,
    /// Signature hashes acceptable during the handshake, in preference
    /// order. SHA-1 is refused unless explicitly added.
    pub allowed_hashes: Vec<SigningHash>,
}

impl Default for TempestConfig {
    fn default() -> Self {
        TempestConfig {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_connections: 100,
            ping_interval: Duration::from_secs(15),
            response_timeout: Duration::from_secs(30),
            retransmit_scan: Duration::from_millis(100),
            retransmit_after: Duration::from_millis(600),
            recv_buffer_len: TCP_RECV_BUFFER_LEN,
            send_pool_limit: 64,
            allowed_hashes: vec![SigningHash::Sha256],
        }
    }
}
