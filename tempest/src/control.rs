//! Internal control messages, carried on the reserved protocol id 1.
//!
//! These drive the handshake, reliable delivery and keep-alive layers.
//! They parse with nothing but the base registry, so a peer can be
//! spoken to before any user protocol is agreed.

use std::time::Duration;

use tempest_proto::{
    BufferReader, BufferWriter, DeserializationContext, Result as ProtoResult,
    SerializationContext, Serializable, Deserializable, Tempest,
};
use tempest_proto::constants::INTERNAL_PROTOCOL_ID;

use crate::error::ConnectionResult;
use crate::message::{Message, MessageFlags};
use crate::protocol::{Protocol, ProtocolRegistry};

pub const CONNECT: u16 = 1;
pub const ACKNOWLEDGE_CONNECT: u16 = 2;
pub const FINAL_CONNECT: u16 = 3;
pub const CONNECTED: u16 = 4;
pub const DISCONNECT: u16 = 5;
pub const ACKNOWLEDGE: u16 = 6;
pub const PARTIAL: u16 = 7;
pub const PING: u16 = 8;
pub const PONG: u16 = 9;

const RELIABLE: MessageFlags = MessageFlags {
    must_be_reliable: true,
    prefer_reliable: true,
    encrypted: false,
    authenticated: false,
    accepted_connectionlessly: false,
};

const CONNECTIONLESS: MessageFlags = MessageFlags {
    must_be_reliable: true,
    prefer_reliable: true,
    encrypted: false,
    authenticated: false,
    accepted_connectionlessly: true,
};

const UNRELIABLE: MessageFlags = MessageFlags {
    must_be_reliable: false,
    prefer_reliable: false,
    encrypted: false,
    authenticated: false,
    accepted_connectionlessly: false,
};

/// A protocol identity as offered during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default, Tempest)]
pub struct ProtocolOffer {
    pub id: u8,
    pub version: i32,
    pub accepted_versions: Vec<i32>,
}

impl From<&Protocol> for ProtocolOffer {
    fn from(p: &Protocol) -> Self {
        ProtocolOffer {
            id: p.id,
            version: p.version,
            accepted_versions: p.accepted_versions().to_vec(),
        }
    }
}

impl ProtocolOffer {
    pub fn into_protocol(self) -> Protocol {
        Protocol::from_wire(self.id, self.version, self.accepted_versions)
    }
}

/// A public key in transit: its wire type name and DER bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Tempest)]
pub struct PublicKeyExchange {
    pub key_type: String,
    pub data: Vec<u8>,
}

impl Serializable for ConnectionResult {
    fn serialize(&self, _ctx: &mut SerializationContext, w: &mut BufferWriter) -> ProtoResult<()> {
        w.write_u8(*self as u8);
        Ok(())
    }
}

impl Deserializable for ConnectionResult {
    fn deserialize(
        _ctx: &mut DeserializationContext,
        r: &mut BufferReader<'_>,
    ) -> ProtoResult<Self> {
        let v = r.read_u8()?;
        ConnectionResult::from_u8(v).ok_or(tempest_proto::Error::InvalidDiscriminant {
            type_name: "ConnectionResult",
            value: v,
        })
    }
}

macro_rules! control_message {
    ($name:ident, $type_id:expr, $flags:expr) => {
        impl Message for $name {
            fn protocol_id(&self) -> u8 {
                INTERNAL_PROTOCOL_ID
            }

            fn message_type(&self) -> u16 {
                $type_id
            }

            fn flags(&self) -> MessageFlags {
                $flags
            }

            fn write_payload(
                &self,
                ctx: &mut SerializationContext,
                w: &mut BufferWriter,
            ) -> ProtoResult<()> {
                self.serialize(ctx, w)
            }

            fn read_payload(
                &mut self,
                ctx: &mut DeserializationContext,
                r: &mut BufferReader<'_>,
            ) -> ProtoResult<()> {
                *self = Self::deserialize(ctx, r)?;
                Ok(())
            }

            fn into_any(self: Box<Self>) -> Box<dyn std::any::Any + Send> {
                self
            }
        }
    };
}

/// Handshake step 1, client to server: the protocols the client speaks
/// and the signature hashes it can produce.
#[derive(Debug, Clone, Default, Tempest)]
pub struct ConnectMessage {
    pub protocols: Vec<ProtocolOffer>,
    pub signature_hash_algs: Vec<String>,
}

control_message!(ConnectMessage, CONNECT, CONNECTIONLESS);

/// Handshake step 2, server to client: the agreed hash, the protocol
/// intersection, the assigned connection id and the server's keys.
#[derive(Debug, Clone, Default, Tempest)]
pub struct AcknowledgeConnectMessage {
    pub signature_hash_alg: String,
    pub enabled_protocols: Vec<ProtocolOffer>,
    pub connection_id: i32,
    pub public_auth_key: PublicKeyExchange,
    pub public_enc_key: PublicKeyExchange,
}

control_message!(AcknowledgeConnectMessage, ACKNOWLEDGE_CONNECT, CONNECTIONLESS);

/// Handshake step 3, client to server: the session key wrapped with the
/// server's encryption key and the client's identity key. The frame is
/// signed with the client's private key under the agreed hash.
#[derive(Debug, Clone, Default, Tempest)]
pub struct FinalConnectMessage {
    pub wrapped_aes_key: Vec<u8>,
    pub public_auth_key: PublicKeyExchange,
}

control_message!(FinalConnectMessage, FINAL_CONNECT, RELIABLE);

/// Handshake step 4, server to client: the connection is live.
#[derive(Debug, Clone, Default, Tempest)]
pub struct ConnectedMessage {
    pub connection_id: i32,
}

control_message!(ConnectedMessage, CONNECTED, RELIABLE);

/// Graceful or reasoned teardown. A peer-sent reason supersedes
/// anything inferred locally.
#[derive(Debug, Clone, Tempest)]
pub struct DisconnectMessage {
    pub reason: ConnectionResult,
    pub custom_text: Option<String>,
}

impl Default for DisconnectMessage {
    fn default() -> Self {
        DisconnectMessage {
            reason: ConnectionResult::Success,
            custom_text: None,
        }
    }
}

control_message!(DisconnectMessage, DISCONNECT, RELIABLE);

/// Batched acknowledgement of received reliable message ids.
#[derive(Debug, Clone, Default, Tempest)]
pub struct AcknowledgeMessage {
    pub message_ids: Vec<i32>,
}

control_message!(AcknowledgeMessage, ACKNOWLEDGE, UNRELIABLE);

/// One fragment of a message that exceeded the datagram payload
/// budget. The first fragment travels under the original message id;
/// later fragments draw fresh reliable ids.
#[derive(Debug, Clone, Default, Tempest)]
pub struct PartialMessage {
    pub original_message_id: i32,
    pub count: i32,
    pub data: Vec<u8>,
}

control_message!(PartialMessage, PARTIAL, RELIABLE);

/// Keep-alive probe. The interval tells the peer how often to expect
/// the next one.
#[derive(Debug, Clone, Default, Tempest)]
pub struct PingMessage {
    pub interval: Duration,
}

control_message!(PingMessage, PING, UNRELIABLE);

/// Keep-alive reply.
#[derive(Debug, Clone, Default, Tempest)]
pub struct PongMessage {}

control_message!(PongMessage, PONG, UNRELIABLE);

/// Installs factories for every control message. Called once when a
/// registry is constructed.
pub(crate) fn register_control_messages(registry: &mut ProtocolRegistry) {
    registry.register_internal(CONNECT, || Box::new(ConnectMessage::default()));
    registry.register_internal(ACKNOWLEDGE_CONNECT, || {
        Box::new(AcknowledgeConnectMessage::default())
    });
    registry.register_internal(FINAL_CONNECT, || Box::new(FinalConnectMessage::default()));
    registry.register_internal(CONNECTED, || Box::new(ConnectedMessage::default()));
    registry.register_internal(DISCONNECT, || Box::new(DisconnectMessage::default()));
    registry.register_internal(ACKNOWLEDGE, || Box::new(AcknowledgeMessage::default()));
    registry.register_internal(PARTIAL, || Box::new(PartialMessage::default()));
    registry.register_internal(PING, || Box::new(PingMessage::default()));
    registry.register_internal(PONG, || Box::new(PongMessage::default()));
}
