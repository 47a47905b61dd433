//! The message abstraction: typed payloads with delivery attributes.

use tempest_proto::constants::{MAX_MESSAGE_ID, MESSAGE_ID_HALF_WINDOW, RESPONSE_FLAG};
use tempest_proto::{
    BufferReader, BufferWriter, DeserializationContext, Result as ProtoResult,
    SerializationContext, TypeMap,
};

/// Identifier of a single message on a connection. Reliable ids occupy
/// `1..MAX_MESSAGE_ID` and wrap; id 0 marks an unreliable message that
/// bypasses ordering and acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MessageId(pub i32);

impl MessageId {
    pub const UNRELIABLE: MessageId = MessageId(0);

    pub fn is_reliable(self) -> bool {
        self.0 != 0
    }

    /// The id following this one, wrapping inside the 23-bit space and
    /// skipping the reserved 0.
    pub fn next(self) -> MessageId {
        let n = (self.0 + 1) % MAX_MESSAGE_ID;
        MessageId(if n == 0 { 1 } else { n })
    }

    /// Forward distance from `from` to `self` in the wrapping reliable
    /// id space `1..MAX_MESSAGE_ID` (size `MAX_MESSAGE_ID - 1`, since 0
    /// is reserved). A distance beyond the half window means `self` is
    /// behind `from`. A zero `from` means nothing has been seen yet.
    pub fn forward_gap(self, from: MessageId) -> i32 {
        if from.0 == 0 {
            return self.0;
        }
        (self.0 - from.0).rem_euclid(MAX_MESSAGE_ID - 1)
    }

    /// Whether this id is ahead of `other` in the wrapping id space.
    pub fn is_after(self, other: MessageId) -> bool {
        let gap = self.forward_gap(other);
        gap > 0 && gap <= MESSAGE_ID_HALF_WINDOW
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier a provider assigns to each accepted connection. Zero is
/// reserved for the connectionless space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnectionId(pub i32);

impl ConnectionId {
    pub const NONE: ConnectionId = ConnectionId(0);

    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery attributes of a message definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags {
    /// The transport must deliver this message or fail the connection;
    /// on datagram transports it always enters the reliable machinery.
    pub must_be_reliable: bool,
    /// Delivered reliably where the transport supports it cheaply.
    pub prefer_reliable: bool,
    /// Payload is encrypted with the session key.
    pub encrypted: bool,
    /// Frame carries a signature when not encrypted.
    pub authenticated: bool,
    /// May be processed before any connection is established.
    pub accepted_connectionlessly: bool,
}

impl MessageFlags {
    pub const RELIABLE: MessageFlags = MessageFlags {
        must_be_reliable: true,
        prefer_reliable: true,
        encrypted: false,
        authenticated: false,
        accepted_connectionlessly: false,
    };

    pub fn reliable(self) -> bool {
        self.must_be_reliable || self.prefer_reliable
    }
}

/// A typed message: the unit of exchange on every Tempest transport.
///
/// Implementations pair a `(protocol id, message type)` identity with
/// payload I/O through the serialization context, which carries the
/// per-message type map the framer flushes into the header.
///
/// `into_any` gives receivers their concrete type back after dispatch;
/// the usual implementation is `fn into_any(self: Box<Self>) ->
/// Box<dyn Any + Send> { self }`.
pub trait Message: Send {
    fn protocol_id(&self) -> u8;
    fn message_type(&self) -> u16;

    fn flags(&self) -> MessageFlags {
        MessageFlags::default()
    }

    fn write_payload(&self, ctx: &mut SerializationContext, w: &mut BufferWriter)
    -> ProtoResult<()>;

    fn read_payload(
        &mut self,
        ctx: &mut DeserializationContext,
        r: &mut BufferReader<'_>,
    ) -> ProtoResult<()>;

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any + Send>;
}

/// Downcasts a parsed message to its concrete type.
pub fn downcast<T: 'static>(message: Box<dyn Message>) -> Option<Box<T>> {
    message.into_any().downcast::<T>().ok()
}

impl std::fmt::Debug for dyn Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message({}/{})", self.protocol_id(), self.message_type())
    }
}

/// Parsed frame header. Produced by the framer's header state machine
/// once every field through the optional type table has been committed.
#[derive(Debug, Default)]
pub struct MessageHeader {
    pub protocol_id: u8,
    pub connection_id: ConnectionId,
    pub message_type: u16,
    /// Total frame length in bytes, from offset 0 through the trailing
    /// envelope.
    pub message_len: usize,
    /// Wire bytes preceding the payload (plaintext frames only).
    pub header_len: usize,
    pub has_type_table: bool,
    pub message_id: MessageId,
    pub is_response: bool,
    pub flags: MessageFlags,
    /// Type table absorbed from the header block.
    pub types: TypeMap,
    /// IV recovered from an encrypted frame.
    pub iv: Option<[u8; 16]>,
    /// Decrypted tail of an encrypted frame: message-id word, optional
    /// type table and payload.
    pub decrypted: Option<Vec<u8>>,
    /// Payload start, relative to `decrypted` when present, otherwise
    /// to the frame.
    pub payload_offset: usize,
}

impl MessageHeader {
    /// Packs the message-id word: `id | RESPONSE_FLAG` when the message
    /// answers an earlier one.
    pub fn pack_message_id(id: MessageId, is_response: bool) -> i32 {
        if is_response { id.0 | RESPONSE_FLAG } else { id.0 }
    }

    /// Splits a message-id word into id and response flag.
    pub fn unpack_message_id(word: i32) -> (MessageId, bool) {
        (
            MessageId(word & (MAX_MESSAGE_ID - 1)),
            word & RESPONSE_FLAG != 0,
        )
    }
}
