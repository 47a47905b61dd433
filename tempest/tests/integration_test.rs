//! End-to-end scenarios over real sockets on the loopback interface.

mod common;

use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;

use common::{EchoMessage, SealedMessage, registry, registry_with, test_keys, type_registry};
use tempest::crypto::AuthKey;
use tempest::dispatch::{Dispatcher, ExecutionMode};
use tempest::message::downcast;
use tempest::protocol::Protocol;
use tempest::tcp::{TcpClientOptions, TcpConnection, TcpListenerProvider, TcpServerOptions};
use tempest::udp::{UdpClientOptions, UdpConnection, UdpProvider, UdpServerOptions};
use tempest::{ConnectionResult, Error, TempestConfig};

const WAIT: Duration = Duration::from_secs(10);

fn echo_dispatcher() -> Arc<Dispatcher> {
    let dispatcher = Dispatcher::new(ExecutionMode::PerConnection);
    dispatcher.register(common::TEST_PROTOCOL, common::ECHO_TYPE, |event| {
        let (_cid, header, message, tx) = event.split();
        let echo = downcast::<EchoMessage>(message).expect("echo payload");
        // Keep replies under the datagram fragmentation budget.
        let text = if echo.text.len() > 256 {
            format!("len:{}", echo.text.len())
        } else {
            echo.text
        };
        tx.respond(header.message_id, Box::new(EchoMessage::new(text)))
            .expect("respond");
    });
    dispatcher.register(common::TEST_PROTOCOL, common::SEALED_TYPE, |event| {
        let (_cid, header, message, tx) = event.split();
        let sealed = downcast::<SealedMessage>(message).expect("sealed payload");
        let ok = !sealed.blob.is_empty() && sealed.blob.iter().all(|&b| b == 0xA5);
        let text = if ok { "sealed ok" } else { "sealed bad" };
        tx.respond(header.message_id, Box::new(EchoMessage::new(text)))
            .expect("respond");
    });
    dispatcher
}

fn server_config() -> TempestConfig {
    TempestConfig {
        ping_interval: Duration::from_millis(200),
        ..TempestConfig::default()
    }
}

fn tcp_server_options(seed: u64) -> TcpServerOptions {
    let (server_key, _) = test_keys();
    TcpServerOptions {
        registry: registry(),
        types: type_registry(),
        config: server_config(),
        auth_key: server_key,
        enc_key: None,
        dispatcher: echo_dispatcher(),
        on_connection: None,
        rng: Some(StdRng::seed_from_u64(seed)),
    }
}

fn tcp_client_options(seed: u64) -> TcpClientOptions {
    let (_, client_key) = test_keys();
    TcpClientOptions {
        registry: registry(),
        types: type_registry(),
        config: TempestConfig::default(),
        auth_key: client_key,
        dispatcher: Dispatcher::new(ExecutionMode::PerConnection),
        rng: Some(StdRng::seed_from_u64(seed)),
    }
}

async fn expect_echo(client: &TcpConnection, text: &str) -> String {
    let future = client
        .send_for(Box::new(EchoMessage::new(text)), Some(WAIT))
        .expect("send_for");
    let response = tokio::time::timeout(WAIT, future.wait())
        .await
        .expect("response in time")
        .expect("response ok");
    downcast::<EchoMessage>(response.message).expect("echo").text
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tcp_handshake_echo_and_ping() {
    let provider = TcpListenerProvider::bind("127.0.0.1:0".parse().unwrap(), tcp_server_options(1))
        .await
        .expect("bind");
    let client = TcpConnection::connect(provider.local_addr(), tcp_client_options(2))
        .await
        .expect("connect");

    assert!(client.is_connected());
    assert!(client.connection_id().is_assigned());
    let (server_key, _) = test_keys();
    assert_eq!(
        client.remote_key().expect("remote key").public_bytes().unwrap(),
        server_key.public_bytes().unwrap()
    );

    assert_eq!(expect_echo(&client, "hello over tcp").await, "hello over tcp");

    // Client-initiated keep-alive: the pong carries a measurable RTT.
    client.ping().expect("ping");
    tokio::time::sleep(Duration::from_millis(300)).await;
    let rtt = client.response_time().expect("rtt measured");
    assert!(rtt > Duration::ZERO);

    // The provider's own ping timer measures the peer as well.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(provider.response_time(client.connection_id()).is_some());
    assert!(client.is_connected(), "pings must keep the connection up");

    client.disconnect(ConnectionResult::Success, None).await;
    provider.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tcp_encrypted_payload_round_trip() {
    let provider = TcpListenerProvider::bind("127.0.0.1:0".parse().unwrap(), tcp_server_options(3))
        .await
        .expect("bind");
    let client = TcpConnection::connect(provider.local_addr(), tcp_client_options(4))
        .await
        .expect("connect");

    let future = client
        .send_for(
            Box::new(SealedMessage {
                blob: vec![0xA5; 1024],
            }),
            Some(WAIT),
        )
        .expect("send_for");
    let response = tokio::time::timeout(WAIT, future.wait())
        .await
        .expect("in time")
        .expect("ok");
    assert_eq!(
        downcast::<EchoMessage>(response.message).unwrap().text,
        "sealed ok"
    );

    provider.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tcp_version_mismatch_disconnects() {
    let (server_key, client_key) = test_keys();
    let server_options = TcpServerOptions {
        registry: registry_with(
            Protocol::with_accepted_versions(common::TEST_PROTOCOL, 5, vec![4, 5]).unwrap(),
        ),
        types: type_registry(),
        config: server_config(),
        auth_key: server_key,
        enc_key: None,
        dispatcher: echo_dispatcher(),
        on_connection: None,
        rng: Some(StdRng::seed_from_u64(5)),
    };
    let provider = TcpListenerProvider::bind("127.0.0.1:0".parse().unwrap(), server_options)
        .await
        .expect("bind");

    let client_options = TcpClientOptions {
        registry: registry_with(
            Protocol::with_accepted_versions(common::TEST_PROTOCOL, 3, vec![3]).unwrap(),
        ),
        types: type_registry(),
        config: TempestConfig::default(),
        auth_key: client_key,
        dispatcher: Dispatcher::new(ExecutionMode::PerConnection),
        rng: Some(StdRng::seed_from_u64(6)),
    };
    let err = TcpConnection::connect(provider.local_addr(), client_options)
        .await
        .expect_err("incompatible versions must not connect");
    match err {
        Error::Handshake(reason) => {
            assert_eq!(reason, ConnectionResult::IncompatibleVersion);
        }
        other => panic!("unexpected error: {other}"),
    }

    provider.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tcp_connection_limit_rejects_excess_peers() {
    let mut options = tcp_server_options(7);
    options.config.max_connections = 2;
    let provider = TcpListenerProvider::bind("127.0.0.1:0".parse().unwrap(), options)
        .await
        .expect("bind");

    let first = TcpConnection::connect(provider.local_addr(), tcp_client_options(8))
        .await
        .expect("first connects");
    let second = TcpConnection::connect(provider.local_addr(), tcp_client_options(9))
        .await
        .expect("second connects");
    assert_eq!(provider.connection_count(), 2);

    let third = TcpConnection::connect(provider.local_addr(), tcp_client_options(10)).await;
    assert!(third.is_err(), "third connection must be rejected");

    // Existing connections are unaffected.
    assert!(first.is_connected());
    assert!(second.is_connected());
    assert_eq!(expect_echo(&first, "still here").await, "still here");

    provider.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udp_handshake_echo_and_fragmentation() {
    let (server_key, client_key) = test_keys();
    let server_options = UdpServerOptions {
        registry: registry(),
        types: type_registry(),
        config: server_config(),
        auth_key: server_key,
        enc_key: None,
        dispatcher: echo_dispatcher(),
        on_connection: None,
        rng: Some(StdRng::seed_from_u64(11)),
    };
    let provider = UdpProvider::bind(&["127.0.0.1:0".parse().unwrap()], server_options)
        .await
        .expect("bind");

    let client_options = UdpClientOptions {
        registry: registry(),
        types: type_registry(),
        config: TempestConfig::default(),
        auth_key: client_key,
        dispatcher: Dispatcher::new(ExecutionMode::PerConnection),
        rng: Some(StdRng::seed_from_u64(12)),
    };
    let client = UdpConnection::connect(provider.local_addrs()[0], client_options)
        .await
        .expect("connect");
    assert!(client.is_connected());
    assert!(client.connection_id().is_assigned());

    // Small message round trip.
    let future = client
        .send_for(Box::new(EchoMessage::new("over datagrams")), Some(WAIT))
        .expect("send_for");
    let response = tokio::time::timeout(WAIT, future.wait())
        .await
        .expect("in time")
        .expect("ok");
    assert_eq!(
        downcast::<EchoMessage>(response.message).unwrap().text,
        "over datagrams"
    );

    // A 4 KiB message exceeds the fragment budget and travels as
    // partials; the reply confirms the server saw every byte.
    let big = "b".repeat(4096);
    let future = client
        .send_for(Box::new(EchoMessage::new(&big)), Some(WAIT))
        .expect("send_for");
    let response = tokio::time::timeout(WAIT, future.wait())
        .await
        .expect("in time")
        .expect("ok");
    assert_eq!(
        downcast::<EchoMessage>(response.message).unwrap().text,
        "len:4096"
    );

    // Keep-alive across the datagram transport.
    client.ping().expect("ping");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client.response_time().is_some());

    client.disconnect(ConnectionResult::Success, None).await;
    provider.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tcp_graceful_disconnect_reports_reason() {
    let provider = TcpListenerProvider::bind("127.0.0.1:0".parse().unwrap(), tcp_server_options(13))
        .await
        .expect("bind");
    let client = TcpConnection::connect(provider.local_addr(), tcp_client_options(14))
        .await
        .expect("connect");

    let connection_id = client.connection_id();
    client
        .disconnect(
            ConnectionResult::Custom,
            Some("done for the day".to_owned()),
        )
        .await;
    assert!(!client.is_connected());

    // The provider notices the peer going away.
    for _ in 0..100 {
        if provider.response_time(connection_id).is_none() && provider.connection_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(provider.connection_count(), 0);

    provider.shutdown();
}
