//! Versioned protocol identities and the message factory registry.

use std::collections::HashMap;
use std::sync::Arc;

use tempest_proto::constants::INTERNAL_PROTOCOL_ID;

use crate::error::{Error, Result};
use crate::message::Message;

/// A versioned namespace of message types identified by a one-byte id.
///
/// Two protocols are compatible when their ids match and the version of
/// one side intersects the accepted-versions set of the other.
/// Protocols are constructed at startup and immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protocol {
    pub id: u8,
    pub version: i32,
    accepted_versions: Vec<i32>,
}

impl Protocol {
    /// Creates a protocol accepting only its own version. Id 1 is
    /// reserved for internal control messages.
    pub fn new(id: u8, version: i32) -> Result<Self> {
        Self::with_accepted_versions(id, version, vec![version])
    }

    pub fn with_accepted_versions(id: u8, version: i32, accepted: Vec<i32>) -> Result<Self> {
        if id == INTERNAL_PROTOCOL_ID {
            return Err(Error::ReservedProtocol(id));
        }
        Ok(Protocol {
            id,
            version,
            accepted_versions: accepted,
        })
    }

    /// Constructs an inbound protocol offer without the reserved-id
    /// check; untrusted offers are filtered during intersection.
    pub(crate) fn from_wire(id: u8, version: i32, accepted: Vec<i32>) -> Self {
        Protocol {
            id,
            version,
            accepted_versions: accepted,
        }
    }

    /// Constructor for the reserved internal protocol.
    pub(crate) fn internal() -> Self {
        Protocol {
            id: INTERNAL_PROTOCOL_ID,
            version: 1,
            accepted_versions: vec![1],
        }
    }

    pub fn accepted_versions(&self) -> &[i32] {
        &self.accepted_versions
    }

    /// Picks the highest remote version this side accepts, if any.
    pub fn compatible_version(&self, remote_accepted: &[i32]) -> Option<i32> {
        let mut best = None;
        for &v in &self.accepted_versions {
            if remote_accepted.contains(&v) && best.is_none_or(|b| v > b) {
                best = Some(v);
            }
        }
        best
    }
}

type MessageFactory = dyn Fn() -> Box<dyn Message> + Send + Sync;

/// Registry of protocols and their message factories.
///
/// A registry handle is shared by every connection of a provider or
/// client; there is no process-wide instance, so independent stacks can
/// register conflicting protocols without interfering.
pub struct ProtocolRegistry {
    protocols: HashMap<u8, Protocol>,
    factories: HashMap<(u8, u16), Arc<MessageFactory>>,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolRegistry {
    /// An empty registry. The internal control protocol is always
    /// present; its factories are installed by the framing layer.
    pub fn new() -> Self {
        let mut registry = ProtocolRegistry {
            protocols: HashMap::new(),
            factories: HashMap::new(),
        };
        registry.protocols.insert(INTERNAL_PROTOCOL_ID, Protocol::internal());
        crate::control::register_control_messages(&mut registry);
        registry
    }

    pub fn register(&mut self, protocol: Protocol) -> Result<()> {
        if self.protocols.contains_key(&protocol.id) {
            return Err(Error::DuplicateProtocol(protocol.id));
        }
        self.protocols.insert(protocol.id, protocol);
        Ok(())
    }

    /// Registers a message factory. Duplicate `(protocol, type)` pairs
    /// are configuration errors.
    pub fn register_message<F>(&mut self, protocol_id: u8, type_id: u16, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Message> + Send + Sync + 'static,
    {
        if !self.protocols.contains_key(&protocol_id) {
            return Err(Error::UnknownProtocol(protocol_id));
        }
        if self.factories.contains_key(&(protocol_id, type_id)) {
            return Err(Error::DuplicateMessageType {
                protocol_id,
                type_id,
            });
        }
        self.factories
            .insert((protocol_id, type_id), Arc::new(factory));
        Ok(())
    }

    pub(crate) fn register_internal<F>(&mut self, type_id: u16, factory: F)
    where
        F: Fn() -> Box<dyn Message> + Send + Sync + 'static,
    {
        self.factories
            .insert((INTERNAL_PROTOCOL_ID, type_id), Arc::new(factory));
    }

    pub fn protocol(&self, id: u8) -> Option<&Protocol> {
        self.protocols.get(&id)
    }

    pub fn contains_protocol(&self, id: u8) -> bool {
        self.protocols.contains_key(&id)
    }

    /// Instantiates an empty message for an inbound frame.
    pub fn create(&self, protocol_id: u8, type_id: u16) -> Option<Box<dyn Message>> {
        self.factories.get(&(protocol_id, type_id)).map(|f| f())
    }

    /// Protocols this registry shares with a remote offer, version
    /// intersection applied. The internal protocol never participates.
    pub fn intersect(&self, offer: &[Protocol]) -> Vec<Protocol> {
        let mut shared = Vec::new();
        for remote in offer {
            if remote.id == INTERNAL_PROTOCOL_ID {
                continue;
            }
            if let Some(local) = self.protocols.get(&remote.id)
                && let Some(version) = local.compatible_version(remote.accepted_versions())
            {
                let mut agreed = local.clone();
                agreed.version = version;
                shared.push(agreed);
            }
        }
        shared
    }

    /// User-registered protocols, for the handshake offer.
    pub fn user_protocols(&self) -> Vec<Protocol> {
        let mut out: Vec<Protocol> = self
            .protocols
            .values()
            .filter(|p| p.id != INTERNAL_PROTOCOL_ID)
            .cloned()
            .collect();
        out.sort_by_key(|p| p.id);
        out
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &self.protocols.len())
            .field("message_types", &self.factories.len())
            .finish()
    }
}
