//! The mutual authentication handshake.
//!
//! Three messages on the internal protocol establish the session:
//!
//! 1. `Connect` (client): offered protocols and signature hashes.
//! 2. `AcknowledgeConnect` (server): selected hash, protocol
//!    intersection, assigned connection id, server public keys.
//! 3. `FinalConnect` (client): session key wrapped with the server's
//!    encryption key plus the client's public auth key, the whole frame
//!    signed with the client's private key under the selected hash.
//!
//! The server verifies the signature, unwraps the key and answers
//! `Connected`; both sides then install the symmetric state into their
//! framers. Any decode or integrity failure ends the connection with
//! `FailedHandshake`; an empty protocol intersection ends it with
//! `IncompatibleVersion`.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::control::{
    AcknowledgeConnectMessage, ConnectMessage, ConnectedMessage, FinalConnectMessage,
    ProtocolOffer, PublicKeyExchange,
};
use crate::crypto::{AuthKey, RsaAuthKey, SessionCrypto, SigningHash};
use crate::error::{ConnectionResult, Error, Result};
use crate::message::ConnectionId;
use crate::protocol::{Protocol, ProtocolRegistry};

/// Everything a connection needs once the handshake succeeds.
pub struct HandshakeComplete {
    pub connection_id: ConnectionId,
    pub session: Arc<Mutex<SessionCrypto>>,
    pub signing_hash: SigningHash,
    /// Protocols both sides agreed on, versions resolved.
    pub protocols: Vec<Protocol>,
    /// The peer's public authentication key.
    pub remote_key: Arc<dyn AuthKey>,
}

impl std::fmt::Debug for HandshakeComplete {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeComplete")
            .field("connection_id", &self.connection_id)
            .field("signing_hash", &self.signing_hash)
            .field("protocols", &self.protocols.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientStage {
    Start,
    AwaitingAcknowledge,
    AwaitingConnected,
    Done,
}

/// Client half of the handshake, driven by the connection as the
/// server's control messages arrive.
pub struct HandshakeClient {
    registry: Arc<ProtocolRegistry>,
    auth_key: Arc<dyn AuthKey>,
    allowed_hashes: Vec<SigningHash>,
    rng: StdRng,
    stage: ClientStage,
    selected_hash: Option<SigningHash>,
    aes_key: Option<[u8; 32]>,
    server_auth_key: Option<Arc<dyn AuthKey>>,
    connection_id: ConnectionId,
    protocols: Vec<Protocol>,
}

impl HandshakeClient {
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        auth_key: Arc<dyn AuthKey>,
        allowed_hashes: Vec<SigningHash>,
        rng: StdRng,
    ) -> Self {
        HandshakeClient {
            registry,
            auth_key,
            allowed_hashes,
            rng,
            stage: ClientStage::Start,
            selected_hash: None,
            aes_key: None,
            server_auth_key: None,
            connection_id: ConnectionId::NONE,
            protocols: Vec::new(),
        }
    }

    pub fn selected_hash(&self) -> Option<SigningHash> {
        self.selected_hash
    }

    /// The connection id assigned in the acknowledge step.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Step 1: the opening offer.
    pub fn start(&mut self) -> Result<ConnectMessage> {
        if self.stage != ClientStage::Start {
            return Err(Error::Handshake(ConnectionResult::FailedHandshake));
        }
        let protocols: Vec<ProtocolOffer> = self
            .registry
            .user_protocols()
            .iter()
            .map(ProtocolOffer::from)
            .collect();
        self.stage = ClientStage::AwaitingAcknowledge;
        Ok(ConnectMessage {
            protocols,
            signature_hash_algs: self
                .allowed_hashes
                .iter()
                .map(|h| h.wire_name().to_owned())
                .collect(),
        })
    }

    /// Step 2 to 3: consume the server's acknowledgement and produce
    /// the signed final message. The returned hash and key are what the
    /// framer must sign the outgoing frame with.
    pub fn on_acknowledge(
        &mut self,
        ack: AcknowledgeConnectMessage,
    ) -> Result<(FinalConnectMessage, Arc<dyn AuthKey>, SigningHash)> {
        if self.stage != ClientStage::AwaitingAcknowledge {
            return Err(Error::Handshake(ConnectionResult::FailedHandshake));
        }

        let hash = SigningHash::from_wire_name(&ack.signature_hash_alg)
            .filter(|h| self.allowed_hashes.contains(h))
            .ok_or(Error::Handshake(ConnectionResult::FailedHandshake))?;

        if ack.enabled_protocols.is_empty() {
            return Err(Error::Handshake(ConnectionResult::IncompatibleVersion));
        }
        let agreed: Vec<Protocol> = ack
            .enabled_protocols
            .into_iter()
            .map(ProtocolOffer::into_protocol)
            .collect();
        for protocol in &agreed {
            let known = self
                .registry
                .protocol(protocol.id)
                .is_some_and(|local| local.accepted_versions().contains(&protocol.version));
            if !known {
                debug!(protocol = protocol.id, version = protocol.version,
                    "server enabled a protocol version we never offered");
                return Err(Error::Handshake(ConnectionResult::IncompatibleVersion));
            }
        }

        let server_auth = import_key(&ack.public_auth_key)
            .map_err(|_| Error::Handshake(ConnectionResult::FailedHandshake))?;
        let server_enc = import_key(&ack.public_enc_key)
            .map_err(|_| Error::Handshake(ConnectionResult::FailedHandshake))?;

        let mut aes_key = [0u8; 32];
        self.rng.fill_bytes(&mut aes_key);
        let wrapped = server_enc.encrypt(&mut self.rng, &aes_key)?;

        self.selected_hash = Some(hash);
        self.aes_key = Some(aes_key);
        self.server_auth_key = Some(server_auth);
        self.connection_id = ConnectionId(ack.connection_id);
        self.protocols = agreed;
        self.stage = ClientStage::AwaitingConnected;

        let message = FinalConnectMessage {
            wrapped_aes_key: wrapped,
            public_auth_key: PublicKeyExchange {
                key_type: self.auth_key.key_type().to_owned(),
                data: self.auth_key.public_bytes()?,
            },
        };
        Ok((message, self.auth_key.clone(), hash))
    }

    /// Step 4: the server confirmed; build the session state.
    pub fn on_connected(&mut self, connected: ConnectedMessage) -> Result<HandshakeComplete> {
        if self.stage != ClientStage::AwaitingConnected {
            return Err(Error::Handshake(ConnectionResult::FailedHandshake));
        }
        if connected.connection_id != self.connection_id.0 {
            warn!(
                expected = self.connection_id.0,
                got = connected.connection_id,
                "connected message for a different connection id"
            );
            return Err(Error::Handshake(ConnectionResult::FailedHandshake));
        }
        let hash = self
            .selected_hash
            .ok_or(Error::Handshake(ConnectionResult::FailedHandshake))?;
        let mut aes_key = self
            .aes_key
            .take()
            .ok_or(Error::Handshake(ConnectionResult::FailedHandshake))?;
        let session_rng = StdRng::seed_from_u64(self.rng.next_u64());
        let session = Arc::new(Mutex::new(SessionCrypto::new(aes_key, hash, session_rng)));
        aes_key.zeroize();
        self.stage = ClientStage::Done;

        Ok(HandshakeComplete {
            connection_id: self.connection_id,
            session,
            signing_hash: hash,
            protocols: std::mem::take(&mut self.protocols),
            remote_key: self
                .server_auth_key
                .clone()
                .expect("set alongside selected_hash"),
        })
    }
}

impl std::fmt::Debug for HandshakeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeClient")
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerStage {
    AwaitingConnect,
    AwaitingFinal,
    Done,
}

/// Server half of the handshake for one pending connection.
pub struct HandshakeServer {
    registry: Arc<ProtocolRegistry>,
    auth_key: Arc<RsaAuthKey>,
    enc_key: Arc<RsaAuthKey>,
    allowed_hashes: Vec<SigningHash>,
    connection_id: ConnectionId,
    rng: StdRng,
    stage: ServerStage,
    selected_hash: Option<SigningHash>,
    protocols: Vec<Protocol>,
}

impl HandshakeServer {
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        auth_key: Arc<RsaAuthKey>,
        enc_key: Arc<RsaAuthKey>,
        allowed_hashes: Vec<SigningHash>,
        connection_id: ConnectionId,
        rng: StdRng,
    ) -> Self {
        HandshakeServer {
            registry,
            auth_key,
            enc_key,
            allowed_hashes,
            connection_id,
            rng,
            stage: ServerStage::AwaitingConnect,
            selected_hash: None,
            protocols: Vec::new(),
        }
    }

    pub fn selected_hash(&self) -> Option<SigningHash> {
        self.selected_hash
    }

    /// Step 1 to 2: select a hash and intersect protocols.
    pub fn on_connect(&mut self, connect: ConnectMessage) -> Result<AcknowledgeConnectMessage> {
        if self.stage != ServerStage::AwaitingConnect {
            return Err(Error::Handshake(ConnectionResult::FailedHandshake));
        }
        if connect.protocols.is_empty() {
            return Err(Error::Handshake(ConnectionResult::FailedHandshake));
        }

        // First client-offered algorithm we also accept.
        let hash = connect
            .signature_hash_algs
            .iter()
            .filter_map(|name| SigningHash::from_wire_name(name))
            .find(|h| self.allowed_hashes.contains(h))
            .ok_or(Error::Handshake(ConnectionResult::FailedHandshake))?;

        let offer: Vec<Protocol> = connect
            .protocols
            .into_iter()
            .map(ProtocolOffer::into_protocol)
            .collect();
        let agreed = self.registry.intersect(&offer);
        if agreed.is_empty() {
            return Err(Error::Handshake(ConnectionResult::IncompatibleVersion));
        }

        self.selected_hash = Some(hash);
        self.protocols = agreed.clone();
        self.stage = ServerStage::AwaitingFinal;

        Ok(AcknowledgeConnectMessage {
            signature_hash_alg: hash.wire_name().to_owned(),
            enabled_protocols: agreed.iter().map(ProtocolOffer::from).collect(),
            connection_id: self.connection_id.0,
            public_auth_key: PublicKeyExchange {
                key_type: self.auth_key.key_type().to_owned(),
                data: self.auth_key.public_bytes()?,
            },
            public_enc_key: PublicKeyExchange {
                key_type: self.enc_key.key_type().to_owned(),
                data: self.enc_key.public_bytes()?,
            },
        })
    }

    /// Step 3 to 4: verify the client's signature over the frame,
    /// unwrap the session key, and confirm.
    ///
    /// `signed_region` is the final-connect frame up to the signature
    /// block with the length field zeroed, exactly as the client signed
    /// it; `signature` is the trailing block.
    pub fn on_final_connect(
        &mut self,
        message: FinalConnectMessage,
        signed_region: &[u8],
        signature: &[u8],
    ) -> Result<(ConnectedMessage, HandshakeComplete)> {
        if self.stage != ServerStage::AwaitingFinal {
            return Err(Error::Handshake(ConnectionResult::FailedHandshake));
        }
        let hash = self
            .selected_hash
            .ok_or(Error::Handshake(ConnectionResult::FailedHandshake))?;

        let client_key = import_key(&message.public_auth_key)
            .map_err(|_| Error::Handshake(ConnectionResult::FailedHandshake))?;
        client_key
            .verify(hash, signed_region, signature)
            .map_err(|_| Error::Handshake(ConnectionResult::FailedHandshake))?;

        let mut unwrapped = self
            .enc_key
            .decrypt(&message.wrapped_aes_key)
            .map_err(|_| Error::Handshake(ConnectionResult::FailedHandshake))?;
        if unwrapped.len() != 32 {
            unwrapped.zeroize();
            return Err(Error::Handshake(ConnectionResult::FailedHandshake));
        }
        let mut aes_key = [0u8; 32];
        aes_key.copy_from_slice(&unwrapped);
        unwrapped.zeroize();

        let session_rng = StdRng::seed_from_u64(self.rng.next_u64());
        let session = Arc::new(Mutex::new(SessionCrypto::new(aes_key, hash, session_rng)));
        aes_key.zeroize();
        self.stage = ServerStage::Done;

        let complete = HandshakeComplete {
            connection_id: self.connection_id,
            session,
            signing_hash: hash,
            protocols: std::mem::take(&mut self.protocols),
            remote_key: client_key,
        };
        Ok((
            ConnectedMessage {
                connection_id: self.connection_id.0,
            },
            complete,
        ))
    }
}

impl std::fmt::Debug for HandshakeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeServer")
            .field("stage", &self.stage)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

/// Imports a peer public key, rejecting unknown key types.
fn import_key(exchange: &PublicKeyExchange) -> Result<Arc<dyn AuthKey>> {
    if exchange.key_type != RsaAuthKey::WIRE_NAME {
        return Err(Error::Key(format!(
            "unsupported key type {:?}",
            exchange.key_type
        )));
    }
    Ok(Arc::new(RsaAuthKey::from_public_der(&exchange.data)?))
}
