mod common;

use rand::SeedableRng;
use rand::rngs::StdRng;

use common::{framer, registry, registry_with, test_keys};
use tempest::control::{ConnectMessage, FinalConnectMessage};
use tempest::crypto::SigningHash;
use tempest::framer::{HeaderPoll, HeaderState};
use tempest::handshake::{HandshakeClient, HandshakeComplete, HandshakeServer};
use tempest::message::{ConnectionId, MessageId, downcast};
use tempest::protocol::Protocol;
use tempest::{AuthKey, ConnectionResult, Error};
use tempest_proto::constants::DEFAULT_MAX_MESSAGE_SIZE;

fn client(hashes: Vec<SigningHash>) -> HandshakeClient {
    let (_, client_key) = test_keys();
    HandshakeClient::new(registry(), client_key, hashes, StdRng::seed_from_u64(21))
}

fn server(hashes: Vec<SigningHash>, connection_id: i32) -> HandshakeServer {
    let (server_key, _) = test_keys();
    HandshakeServer::new(
        registry(),
        server_key.clone(),
        server_key,
        hashes,
        ConnectionId(connection_id),
        StdRng::seed_from_u64(22),
    )
}

/// Runs the full exchange over real frames, returning both sides'
/// completions.
fn run_handshake(
    mut client: HandshakeClient,
    mut server: HandshakeServer,
) -> Result<(HandshakeComplete, HandshakeComplete), Error> {
    let client_framer = framer(DEFAULT_MAX_MESSAGE_SIZE);
    let server_framer = framer(DEFAULT_MAX_MESSAGE_SIZE);

    let connect = client.start()?;
    let ack = server.on_connect(connect)?;
    let (final_connect, key, hash) = client.on_acknowledge(ack)?;

    // The final step travels as a signed frame; reparse it the way the
    // server's connection would.
    let framed = client_framer.frame_with_key(
        &final_connect,
        client.connection_id(),
        MessageId(2),
        &*key,
        hash,
    )?;
    let mut state = HeaderState::new();
    let HeaderPoll::Complete = server_framer.try_read_header(&mut state, &framed) else {
        panic!("final connect frame did not parse");
    };
    let (mut header, message) = state.finish();
    let message = server_framer.read_payload(&mut header, message, &framed)?;
    let parsed = downcast::<FinalConnectMessage>(message).expect("final connect");
    let (region, signature) = server_framer.split_signed(&header, &framed)?;

    let (connected, server_complete) = server.on_final_connect(*parsed, &region, &signature)?;
    let client_complete = client.on_connected(connected)?;
    Ok((client_complete, server_complete))
}

#[test]
fn full_handshake_establishes_matching_sessions() {
    let (client_done, server_done) =
        run_handshake(client(vec![SigningHash::Sha256]), server(vec![SigningHash::Sha256], 5))
            .expect("handshake");

    assert_eq!(client_done.connection_id, ConnectionId(5));
    assert_eq!(server_done.connection_id, ConnectionId(5));
    assert_eq!(client_done.signing_hash, SigningHash::Sha256);
    assert_eq!(server_done.signing_hash, SigningHash::Sha256);
    assert_eq!(client_done.protocols.len(), 1);
    assert_eq!(client_done.protocols[0].id, common::TEST_PROTOCOL);
    assert_eq!(server_done.protocols.len(), 1);

    // Both sides hold the same symmetric key: one encrypts, the other
    // decrypts.
    let (iv, ciphertext) = client_done.session.lock().encrypt(b"session check");
    let plain = server_done.session.lock().decrypt(&iv, &ciphertext).unwrap();
    assert_eq!(plain, b"session check");

    // And each learned the peer's public authentication key.
    let (server_key, client_key) = test_keys();
    assert_eq!(
        client_done.remote_key.public_bytes().unwrap(),
        server_key.public_bytes().unwrap()
    );
    assert_eq!(
        server_done.remote_key.public_bytes().unwrap(),
        client_key.public_bytes().unwrap()
    );
}

#[test]
fn empty_protocol_offer_fails_handshake() {
    let mut srv = server(vec![SigningHash::Sha256], 1);
    let err = srv
        .on_connect(ConnectMessage {
            protocols: Vec::new(),
            signature_hash_algs: vec!["SHA256".into()],
        })
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Handshake(ConnectionResult::FailedHandshake)
    ));
}

#[test]
fn no_common_hash_fails_handshake() {
    let mut cl = client(vec![SigningHash::Sha256]);
    let mut srv = server(vec![SigningHash::Sha256], 1);
    let mut connect = cl.start().unwrap();
    connect.signature_hash_algs = vec!["MD5".into(), "SHA1".into()];
    let err = srv.on_connect(connect).unwrap_err();
    assert!(matches!(
        err,
        Error::Handshake(ConnectionResult::FailedHandshake)
    ));
}

#[test]
fn sha1_is_refused_by_default() {
    let mut cl = client(vec![SigningHash::Sha1]);
    let mut srv = server(vec![SigningHash::Sha256], 1);
    let connect = cl.start().unwrap();
    let err = srv.on_connect(connect).unwrap_err();
    assert!(matches!(
        err,
        Error::Handshake(ConnectionResult::FailedHandshake)
    ));
}

#[test]
fn version_mismatch_is_incompatible() {
    // Client speaks version 3; the server accepts only 4 and 5.
    let client_registry = registry_with(
        Protocol::with_accepted_versions(common::TEST_PROTOCOL, 3, vec![3]).unwrap(),
    );
    let server_registry = registry_with(
        Protocol::with_accepted_versions(common::TEST_PROTOCOL, 5, vec![4, 5]).unwrap(),
    );
    let (server_key, client_key) = test_keys();
    let mut cl = HandshakeClient::new(
        client_registry,
        client_key,
        vec![SigningHash::Sha256],
        StdRng::seed_from_u64(31),
    );
    let mut srv = HandshakeServer::new(
        server_registry,
        server_key.clone(),
        server_key,
        vec![SigningHash::Sha256],
        ConnectionId(1),
        StdRng::seed_from_u64(32),
    );
    let connect = cl.start().unwrap();
    let err = srv.on_connect(connect).unwrap_err();
    assert!(matches!(
        err,
        Error::Handshake(ConnectionResult::IncompatibleVersion)
    ));
}

#[test]
fn tampered_final_signature_fails() {
    let mut cl = client(vec![SigningHash::Sha256]);
    let mut srv = server(vec![SigningHash::Sha256], 9);
    let connect = cl.start().unwrap();
    let ack = srv.on_connect(connect).unwrap();
    let (final_connect, key, hash) = cl.on_acknowledge(ack).unwrap();

    let client_framer = framer(DEFAULT_MAX_MESSAGE_SIZE);
    let server_framer = framer(DEFAULT_MAX_MESSAGE_SIZE);
    let framed = client_framer
        .frame_with_key(&final_connect, cl.connection_id(), MessageId(2), &*key, hash)
        .unwrap();

    let mut state = HeaderState::new();
    let HeaderPoll::Complete = server_framer.try_read_header(&mut state, &framed) else {
        panic!("frame did not parse");
    };
    let (header, _message) = state.finish();
    let (region, mut signature) = server_framer.split_signed(&header, &framed).unwrap();
    signature[0] ^= 0x01;

    let err = srv
        .on_final_connect(final_connect, &region, &signature)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Handshake(ConnectionResult::FailedHandshake)
    ));
}

#[test]
fn reserved_protocol_cannot_be_registered_by_users() {
    assert!(matches!(
        Protocol::new(1, 1),
        Err(Error::ReservedProtocol(1))
    ));
}
