//! Wire-visible constants for the Tempest framing protocol.
//!
//! These values are observed on the wire by remote peers and must not
//! drift between implementations.

/// Length of the fixed header prefix: protocol id (1) + connection id (4)
/// + message type (2) + length/flag word (4) + message id word (4).
pub const BASE_HEADER_LEN: usize = 15;

/// Byte offset of the length/flag word within the header:
/// protocol id (1) + connection id (4) + message type (2).
pub const LENGTH_FIELD_OFFSET: usize = 7;

/// Bit set in the message-id word when the message is a response to an
/// earlier message with the same id.
pub const RESPONSE_FLAG: i32 = 0x0100_0000;

/// Exclusive upper bound of the message-id space. Ids occupy 23 bits of
/// the message-id word; the 24th bit is [`RESPONSE_FLAG`].
pub const MAX_MESSAGE_ID: i32 = 0x0080_0000;

/// Half of the id space. An apparent forward gap larger than this is
/// treated as a stale (already seen) id under modular arithmetic.
pub const MESSAGE_ID_HALF_WINDOW: i32 = MAX_MESSAGE_ID / 2;

/// Protocol id reserved for Tempest's internal control messages
/// (connect handshake, acknowledgements, ping).
pub const INTERNAL_PROTOCOL_ID: u8 = 1;

/// Protocol id of the connectionless space. Messages carrying it are
/// never associated with an established connection.
pub const CONNECTIONLESS_PROTOCOL_ID: u8 = 0;

/// How far ahead of the last in-order id a reliable message may arrive
/// before it is rejected as suspicious.
pub const RELIABLE_WINDOW: i32 = 2000;

/// Payload budget of a single UDP fragment. Serialized messages larger
/// than this are split into partial messages of at most this many bytes.
pub const UDP_FRAGMENT_PAYLOAD: usize = 490;

/// Default cap on the total size of a single framed message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Initial size of a TCP connection's receive buffer. Grows when a
/// single declared message length exceeds the free tail.
pub const TCP_RECV_BUFFER_LEN: usize = 20 * 1024;

/// AES block length; CBC ciphertext is padded to a multiple of this.
pub const AES_BLOCK_LEN: usize = 16;

/// Length of the per-message initialization vector spliced into
/// encrypted frames.
pub const IV_LEN: usize = 16;

/// Most distinct value types a single message may intern. The type
/// table's count field is written as an i16 on the wire.
pub const MAX_TYPES_PER_MESSAGE: usize = i16::MAX as usize;
