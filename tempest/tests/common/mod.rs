#![allow(dead_code)]

//! Shared fixtures: a small user protocol with plain, encrypted,
//! signed and typed messages, plus key material reused across tests.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;

use tempest::crypto::{RsaAuthKey, SessionCrypto, SigningHash};
use tempest::framer::Framer;
use tempest::message::{Message, MessageFlags};
use tempest::protocol::{Protocol, ProtocolRegistry};
use tempest_proto::{
    BufferReader, BufferWriter, DeserializationContext, Result as ProtoResult,
    SerializationContext, TypeRegistry, TypedValue,
};

pub const TEST_PROTOCOL: u8 = 7;
pub const TEST_VERSION: i32 = 1;
pub const ECHO_TYPE: u16 = 1;
pub const SEALED_TYPE: u16 = 2;
pub const SIGNED_TYPE: u16 = 3;
pub const TAGGED_TYPE: u16 = 4;

/// Plain text message, delivered reliably.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EchoMessage {
    pub text: String,
}

impl EchoMessage {
    pub fn new(text: impl Into<String>) -> Self {
        EchoMessage { text: text.into() }
    }
}

impl Message for EchoMessage {
    fn protocol_id(&self) -> u8 {
        TEST_PROTOCOL
    }

    fn message_type(&self) -> u16 {
        ECHO_TYPE
    }

    fn flags(&self) -> MessageFlags {
        MessageFlags {
            prefer_reliable: true,
            ..MessageFlags::default()
        }
    }

    fn write_payload(
        &self,
        _ctx: &mut SerializationContext,
        w: &mut BufferWriter,
    ) -> ProtoResult<()> {
        w.write_string(Some(&self.text));
        Ok(())
    }

    fn read_payload(
        &mut self,
        _ctx: &mut DeserializationContext,
        r: &mut BufferReader<'_>,
    ) -> ProtoResult<()> {
        self.text = r.read_string()?.unwrap_or_default();
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any + Send> {
        self
    }
}

/// Encrypted binary payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SealedMessage {
    pub blob: Vec<u8>,
}

impl Message for SealedMessage {
    fn protocol_id(&self) -> u8 {
        TEST_PROTOCOL
    }

    fn message_type(&self) -> u16 {
        SEALED_TYPE
    }

    fn flags(&self) -> MessageFlags {
        MessageFlags {
            prefer_reliable: true,
            encrypted: true,
            ..MessageFlags::default()
        }
    }

    fn write_payload(
        &self,
        _ctx: &mut SerializationContext,
        w: &mut BufferWriter,
    ) -> ProtoResult<()> {
        w.write_bytes(&self.blob);
        Ok(())
    }

    fn read_payload(
        &mut self,
        _ctx: &mut DeserializationContext,
        r: &mut BufferReader<'_>,
    ) -> ProtoResult<()> {
        self.blob = r.read_bytes()?;
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any + Send> {
        self
    }
}

/// Authenticated (HMAC-signed) but unencrypted payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignedMessage {
    pub value: i64,
}

impl Message for SignedMessage {
    fn protocol_id(&self) -> u8 {
        TEST_PROTOCOL
    }

    fn message_type(&self) -> u16 {
        SIGNED_TYPE
    }

    fn flags(&self) -> MessageFlags {
        MessageFlags {
            prefer_reliable: true,
            authenticated: true,
            ..MessageFlags::default()
        }
    }

    fn write_payload(
        &self,
        _ctx: &mut SerializationContext,
        w: &mut BufferWriter,
    ) -> ProtoResult<()> {
        w.write_i64(self.value);
        Ok(())
    }

    fn read_payload(
        &mut self,
        _ctx: &mut DeserializationContext,
        r: &mut BufferReader<'_>,
    ) -> ProtoResult<()> {
        self.value = r.read_i64()?;
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any + Send> {
        self
    }
}

/// A polymorphic value carried through the per-message type table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Marker {
    pub label: String,
}

impl tempest_proto::Serializable for Marker {
    fn serialize(
        &self,
        _ctx: &mut SerializationContext,
        w: &mut BufferWriter,
    ) -> ProtoResult<()> {
        w.write_string(Some(&self.label));
        Ok(())
    }
}

impl tempest_proto::Deserializable for Marker {
    fn deserialize(
        _ctx: &mut DeserializationContext,
        r: &mut BufferReader<'_>,
    ) -> ProtoResult<Self> {
        Ok(Marker {
            label: r.read_string()?.unwrap_or_default(),
        })
    }
}

impl TypedValue for Marker {
    fn wire_name(&self) -> &str {
        "Test.Marker"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Message whose payload goes through `write_typed`, forcing a type
/// table into the header.
#[derive(Debug, Clone, Default)]
pub struct TaggedMessage {
    pub marker: Marker,
    /// Filled on the receive side.
    pub received: Option<Marker>,
}

impl Message for TaggedMessage {
    fn protocol_id(&self) -> u8 {
        TEST_PROTOCOL
    }

    fn message_type(&self) -> u16 {
        TAGGED_TYPE
    }

    fn flags(&self) -> MessageFlags {
        MessageFlags {
            prefer_reliable: true,
            ..MessageFlags::default()
        }
    }

    fn write_payload(
        &self,
        ctx: &mut SerializationContext,
        w: &mut BufferWriter,
    ) -> ProtoResult<()> {
        ctx.write_typed(w, &self.marker)
    }

    fn read_payload(
        &mut self,
        ctx: &mut DeserializationContext,
        r: &mut BufferReader<'_>,
    ) -> ProtoResult<()> {
        let value = ctx.read_typed(r)?;
        self.received = value.as_any().downcast_ref::<Marker>().cloned();
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any + Send> {
        self
    }
}

pub fn registry() -> Arc<ProtocolRegistry> {
    registry_with(Protocol::new(TEST_PROTOCOL, TEST_VERSION).expect("valid protocol"))
}

pub fn registry_with(protocol: Protocol) -> Arc<ProtocolRegistry> {
    let mut registry = ProtocolRegistry::new();
    let id = protocol.id;
    registry.register(protocol).expect("register protocol");
    registry
        .register_message(id, ECHO_TYPE, || Box::new(EchoMessage::default()))
        .expect("register echo");
    registry
        .register_message(id, SEALED_TYPE, || Box::new(SealedMessage::default()))
        .expect("register sealed");
    registry
        .register_message(id, SIGNED_TYPE, || Box::new(SignedMessage::default()))
        .expect("register signed");
    registry
        .register_message(id, TAGGED_TYPE, || Box::new(TaggedMessage::default()))
        .expect("register tagged");
    Arc::new(registry)
}

pub fn type_registry() -> Arc<TypeRegistry> {
    let mut types = TypeRegistry::new();
    types.register::<Marker>("Test.Marker");
    Arc::new(types)
}

pub fn framer(max: usize) -> Framer {
    Framer::new(registry(), type_registry(), max)
}

/// A session pair sharing one key, as the handshake would install.
pub fn session_pair(seed: u64) -> (Arc<Mutex<SessionCrypto>>, Arc<Mutex<SessionCrypto>>) {
    let mut key = [0u8; 32];
    let mut rng = StdRng::seed_from_u64(seed);
    rand::RngCore::fill_bytes(&mut rng, &mut key);
    let a = SessionCrypto::new(key, SigningHash::Sha256, StdRng::seed_from_u64(seed ^ 1));
    let b = SessionCrypto::new(key, SigningHash::Sha256, StdRng::seed_from_u64(seed ^ 2));
    (Arc::new(Mutex::new(a)), Arc::new(Mutex::new(b)))
}

/// Generating RSA keys is slow; share one pair per test binary.
pub fn test_keys() -> (Arc<RsaAuthKey>, Arc<RsaAuthKey>) {
    static KEYS: OnceLock<(Arc<RsaAuthKey>, Arc<RsaAuthKey>)> = OnceLock::new();
    KEYS.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(0x7E57_5EED);
        let server = RsaAuthKey::generate_with_bits(&mut rng, 1024).expect("server key");
        let client = RsaAuthKey::generate_with_bits(&mut rng, 1024).expect("client key");
        (Arc::new(server), Arc::new(client))
    })
    .clone()
}
