mod common;

use std::sync::Arc;

use parking_lot::Mutex;

use common::{EchoMessage, registry, type_registry};
use tempest::TempestConfig;
use tempest::connection::ConnectionEvent;
use tempest::dispatch::FrameId;
use tempest::message::{ConnectionId, MessageId, downcast};
use tempest::reliable::MessageIdAllocator;
use tempest::tcp::TcpConnectionCore;
use tempest::{ConnectionResult, framer::Framer};
use tempest_proto::constants::DEFAULT_MAX_MESSAGE_SIZE;

fn core_with_buffer(recv_buffer_len: usize) -> TcpConnectionCore {
    let config = TempestConfig {
        recv_buffer_len,
        ..TempestConfig::default()
    };
    TcpConnectionCore::new(
        registry(),
        type_registry(),
        &config,
        Arc::new(Mutex::new(MessageIdAllocator::new())),
    )
}

fn sender_framer() -> Framer {
    Framer::new(registry(), type_registry(), DEFAULT_MAX_MESSAGE_SIZE)
}

fn frame_echo(f: &Framer, text: &str, id: i32) -> Vec<u8> {
    f.frame(&EchoMessage::new(text), ConnectionId(1), MessageId(id), false)
        .unwrap()
}

fn take_messages(core: &mut TcpConnectionCore) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(event) = core.poll_event() {
        if let ConnectionEvent::Message { message, .. } = event {
            out.push(downcast::<EchoMessage>(message).unwrap().text);
        }
    }
    out
}

#[test]
fn whole_frame_in_one_read() {
    let mut core = core_with_buffer(20 * 1024);
    let frame = frame_echo(&sender_framer(), "one", 1);
    core.on_bytes(&frame).unwrap();
    assert_eq!(take_messages(&mut core), vec!["one"]);
}

#[test]
fn bytes_arriving_one_at_a_time() {
    let mut core = core_with_buffer(20 * 1024);
    let frame = frame_echo(&sender_framer(), "trickle", 1);
    for &byte in &frame[..frame.len() - 1] {
        core.on_bytes(&[byte]).unwrap();
        assert!(core.poll_event().is_none());
    }
    core.on_bytes(&[frame[frame.len() - 1]]).unwrap();
    assert_eq!(take_messages(&mut core), vec!["trickle"]);
}

#[test]
fn multiple_frames_in_one_read() {
    let mut core = core_with_buffer(20 * 1024);
    let f = sender_framer();
    let mut bytes = frame_echo(&f, "first", 1);
    bytes.extend(frame_echo(&f, "second", 2));
    bytes.extend(frame_echo(&f, "third", 3));
    core.on_bytes(&bytes).unwrap();
    assert_eq!(take_messages(&mut core), vec!["first", "second", "third"]);
}

#[test]
fn split_across_frame_boundary() {
    let mut core = core_with_buffer(20 * 1024);
    let f = sender_framer();
    let mut bytes = frame_echo(&f, "head", 1);
    bytes.extend(frame_echo(&f, "tail", 2));
    let cut = bytes.len() - 7;
    core.on_bytes(&bytes[..cut]).unwrap();
    assert_eq!(take_messages(&mut core), vec!["head"]);
    core.on_bytes(&bytes[cut..]).unwrap();
    assert_eq!(take_messages(&mut core), vec!["tail"]);
}

#[test]
fn buffer_grows_for_oversized_frame() {
    // A receive buffer far smaller than one frame.
    let mut core = core_with_buffer(64);
    let big_text = "x".repeat(5000);
    let frame = frame_echo(&sender_framer(), &big_text, 1);
    for chunk in frame.chunks(48) {
        core.on_bytes(chunk).unwrap();
    }
    assert_eq!(take_messages(&mut core), vec![big_text]);
}

#[test]
fn replayed_frame_kills_the_connection() {
    let mut core = core_with_buffer(20 * 1024);
    let f = sender_framer();
    let first = frame_echo(&f, "original", 1);
    let second = frame_echo(&f, "next", 2);
    core.on_bytes(&first).unwrap();
    core.on_bytes(&second).unwrap();
    assert_eq!(take_messages(&mut core).len(), 2);

    // A bit-identical duplicate of an earlier frame must not pass the
    // ordering guard.
    let err = core.on_bytes(&first).unwrap_err();
    assert_eq!(err, ConnectionResult::MessageAuthenticationFailed);
}

#[test]
fn stale_id_kills_the_connection() {
    let mut core = core_with_buffer(20 * 1024);
    let f = sender_framer();
    core.on_bytes(&frame_echo(&f, "five", 5)).unwrap();
    let err = core.on_bytes(&frame_echo(&f, "three", 3)).unwrap_err();
    assert_eq!(err, ConnectionResult::MessageAuthenticationFailed);
}

#[test]
fn response_beyond_local_counter_is_rejected() {
    let mut core = core_with_buffer(20 * 1024);
    let f = sender_framer();
    // No local sends yet, so no response can legitimately arrive.
    let response = f
        .frame(&EchoMessage::new("spoof"), ConnectionId(1), MessageId(5), true)
        .unwrap();
    let err = core.on_bytes(&response).unwrap_err();
    assert_eq!(err, ConnectionResult::MessageAuthenticationFailed);
}

#[test]
fn unknown_protocol_terminates_with_failed_unknown() {
    let mut core = core_with_buffer(20 * 1024);
    let mut frame = frame_echo(&sender_framer(), "x", 1);
    frame[0] = 99;
    let err = core.on_bytes(&frame).unwrap_err();
    assert_eq!(err, ConnectionResult::FailedUnknown);
}

#[test]
fn outbound_frames_use_the_assigned_id() {
    let mut core = core_with_buffer(20 * 1024);
    core.set_connection_id(ConnectionId(12));
    let frame = core
        .frame_outbound(&EchoMessage::new("out"), FrameId::Fresh(MessageId(1)))
        .unwrap();

    // Parse what we built with an independent receiver.
    let mut receiver = core_with_buffer(20 * 1024);
    receiver.on_bytes(&frame).unwrap();
    let event = receiver.poll_event().unwrap();
    let ConnectionEvent::Message { header, message, .. } = event else {
        panic!("expected message event");
    };
    assert_eq!(header.connection_id, ConnectionId(12));
    assert_eq!(header.message_id, MessageId(1));
    assert_eq!(downcast::<EchoMessage>(message).unwrap().text, "out");
}
