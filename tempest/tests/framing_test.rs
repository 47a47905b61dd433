mod common;

use common::{
    EchoMessage, Marker, SealedMessage, SignedMessage, TaggedMessage, framer, session_pair,
};
use tempest::framer::{HeaderPoll, HeaderState};
use tempest::message::{ConnectionId, Message, MessageHeader, MessageId, downcast};
use tempest::{ConnectionResult, Error};
use tempest_proto::constants::{DEFAULT_MAX_MESSAGE_SIZE, LENGTH_FIELD_OFFSET};

const CID: ConnectionId = ConnectionId(3);

fn parse(framer: &tempest::framer::Framer, frame: &[u8]) -> (MessageHeader, Box<dyn Message>) {
    let mut state = HeaderState::new();
    match framer.try_read_header(&mut state, frame) {
        HeaderPoll::Complete => {}
        other => panic!("expected complete header, got {other:?}"),
    }
    let (mut header, message) = state.finish();
    let message = framer
        .read_payload(&mut header, message, frame)
        .expect("payload");
    (header, message)
}

fn length_word(frame: &[u8]) -> i32 {
    i32::from_le_bytes(
        frame[LENGTH_FIELD_OFFSET..LENGTH_FIELD_OFFSET + 4]
            .try_into()
            .unwrap(),
    )
}

#[test]
fn plain_round_trip() {
    let f = framer(DEFAULT_MAX_MESSAGE_SIZE);
    let frame = f
        .frame(&EchoMessage::new("hello tempest"), CID, MessageId(1), false)
        .unwrap();

    // The declared length equals the total emitted bytes, flag clear.
    let word = length_word(&frame);
    assert_eq!((word >> 1) as usize, frame.len());
    assert_eq!(word & 1, 0);

    let (header, message) = parse(&f, &frame);
    assert_eq!(header.protocol_id, common::TEST_PROTOCOL);
    assert_eq!(header.connection_id, CID);
    assert_eq!(header.message_id, MessageId(1));
    assert!(!header.is_response);
    assert_eq!(header.message_len, frame.len());
    let echo = downcast::<EchoMessage>(message).unwrap();
    assert_eq!(echo.text, "hello tempest");
}

#[test]
fn response_flag_round_trips() {
    let f = framer(DEFAULT_MAX_MESSAGE_SIZE);
    let frame = f
        .frame(&EchoMessage::new("pong"), CID, MessageId(17), true)
        .unwrap();
    let (header, _message) = parse(&f, &frame);
    assert_eq!(header.message_id, MessageId(17));
    assert!(header.is_response);
}

#[test]
fn type_table_sets_length_flag_and_round_trips() {
    let f = framer(DEFAULT_MAX_MESSAGE_SIZE);
    let message = TaggedMessage {
        marker: Marker {
            label: "tagged".into(),
        },
        received: None,
    };
    let frame = f.frame(&message, CID, MessageId(2), false).unwrap();

    let word = length_word(&frame);
    assert_eq!(word & 1, 1, "type table flag must be set");
    assert_eq!((word >> 1) as usize, frame.len());

    let (header, parsed) = parse(&f, &frame);
    assert!(header.has_type_table);
    assert_eq!(header.types.get(0), Some("Test.Marker"));
    let tagged = downcast::<TaggedMessage>(parsed).unwrap();
    assert_eq!(tagged.received.unwrap().label, "tagged");
}

#[test]
fn header_parses_from_piecemeal_bytes() {
    let f = framer(DEFAULT_MAX_MESSAGE_SIZE);
    let frame = f
        .frame(&EchoMessage::new("drip feed"), CID, MessageId(9), false)
        .unwrap();

    let mut state = HeaderState::new();
    let mut complete_at = None;
    for end in 1..=frame.len() {
        match f.try_read_header(&mut state, &frame[..end]) {
            HeaderPoll::NeedMore => {}
            HeaderPoll::Complete => {
                complete_at = Some(end);
                break;
            }
            HeaderPoll::Invalid(reason) => panic!("invalid at {end}: {reason:?}"),
        }
    }
    // Plain echo has no table: the header completes at the fixed prefix.
    assert_eq!(complete_at, Some(tempest_proto::constants::BASE_HEADER_LEN));
    let (header, message) = state.finish();
    assert_eq!(header.header_len, tempest_proto::constants::BASE_HEADER_LEN);
    let mut header = header;
    let message = f.read_payload(&mut header, message, &frame).unwrap();
    assert_eq!(downcast::<EchoMessage>(message).unwrap().text, "drip feed");
}

#[test]
fn unknown_protocol_is_invalid() {
    let f = framer(DEFAULT_MAX_MESSAGE_SIZE);
    let mut frame = f
        .frame(&EchoMessage::new("x"), CID, MessageId(1), false)
        .unwrap();
    frame[0] = 200; // unregistered protocol id
    let mut state = HeaderState::new();
    assert!(matches!(
        f.try_read_header(&mut state, &frame),
        HeaderPoll::Invalid(ConnectionResult::FailedUnknown)
    ));
}

#[test]
fn non_positive_length_is_invalid() {
    let f = framer(DEFAULT_MAX_MESSAGE_SIZE);
    let mut frame = f
        .frame(&EchoMessage::new("x"), CID, MessageId(1), false)
        .unwrap();
    frame[LENGTH_FIELD_OFFSET..LENGTH_FIELD_OFFSET + 4].fill(0);
    let mut state = HeaderState::new();
    assert!(matches!(
        f.try_read_header(&mut state, &frame),
        HeaderPoll::Invalid(ConnectionResult::FailedUnknown)
    ));
}

#[test]
fn oversized_declared_length_is_invalid() {
    let f = framer(256);
    let frame = f
        .frame(&EchoMessage::new("ok"), CID, MessageId(1), false)
        .unwrap();
    let mut oversized = frame.clone();
    let word = (1024i32 << 1) | (length_word(&frame) & 1);
    oversized[LENGTH_FIELD_OFFSET..LENGTH_FIELD_OFFSET + 4]
        .copy_from_slice(&word.to_le_bytes());
    let mut state = HeaderState::new();
    assert!(matches!(
        f.try_read_header(&mut state, &oversized),
        HeaderPoll::Invalid(ConnectionResult::FailedUnknown)
    ));
}

#[test]
fn encrypted_round_trip() {
    let (session_a, session_b) = session_pair(11);
    let mut sender = framer(DEFAULT_MAX_MESSAGE_SIZE);
    sender.install_crypto(session_a);
    let mut receiver = framer(DEFAULT_MAX_MESSAGE_SIZE);
    receiver.install_crypto(session_b);

    let blob = vec![0xA5u8; 1024];
    let frame = sender
        .frame(
            &SealedMessage { blob: blob.clone() },
            CID,
            MessageId(4),
            false,
        )
        .unwrap();
    // Ciphertext, not plaintext, on the wire.
    assert!(!frame.windows(16).any(|w| w.iter().all(|&b| b == 0xA5)));
    assert_eq!((length_word(&frame) >> 1) as usize, frame.len());

    let (header, message) = parse(&receiver, &frame);
    assert_eq!(header.message_id, MessageId(4));
    assert!(header.iv.is_some());
    let sealed = downcast::<SealedMessage>(message).unwrap();
    assert_eq!(sealed.blob, blob);
}

#[test]
fn corrupted_ciphertext_fails_authentication() {
    let (session_a, session_b) = session_pair(12);
    let mut sender = framer(DEFAULT_MAX_MESSAGE_SIZE);
    sender.install_crypto(session_a);
    let mut receiver = framer(DEFAULT_MAX_MESSAGE_SIZE);
    receiver.install_crypto(session_b);

    let frame = sender
        .frame(
            &SealedMessage {
                blob: vec![0xA5; 1024],
            },
            CID,
            MessageId(5),
            false,
        )
        .unwrap();

    // Flip one byte inside the first ciphertext block.
    let mut tampered = frame.clone();
    let ct_start = LENGTH_FIELD_OFFSET + 4 + 4 + 16;
    tampered[ct_start] ^= 0x01;

    let mut state = HeaderState::new();
    match receiver.try_read_header(&mut state, &tampered) {
        HeaderPoll::Invalid(reason) => {
            assert_eq!(reason, ConnectionResult::MessageAuthenticationFailed);
        }
        HeaderPoll::Complete => {
            let (mut header, message) = state.finish();
            let err = receiver
                .read_payload(&mut header, message, &tampered)
                .unwrap_err();
            assert_eq!(
                err.disposition(),
                ConnectionResult::MessageAuthenticationFailed
            );
        }
        HeaderPoll::NeedMore => panic!("full frame supplied"),
    }
}

#[test]
fn encrypted_without_session_is_rejected() {
    let plain = framer(DEFAULT_MAX_MESSAGE_SIZE);
    let err = plain
        .frame(
            &SealedMessage { blob: vec![1] },
            CID,
            MessageId(1),
            false,
        )
        .unwrap_err();
    assert!(matches!(err, Error::NoSessionKey));
}

#[test]
fn authenticated_round_trip_and_tamper_detection() {
    let (session_a, session_b) = session_pair(13);
    let mut sender = framer(DEFAULT_MAX_MESSAGE_SIZE);
    sender.install_crypto(session_a);
    let mut receiver = framer(DEFAULT_MAX_MESSAGE_SIZE);
    receiver.install_crypto(session_b);

    let frame = sender
        .frame(&SignedMessage { value: -42 }, CID, MessageId(6), false)
        .unwrap();
    assert_eq!((length_word(&frame) >> 1) as usize, frame.len());

    let (_, message) = parse(&receiver, &frame);
    assert_eq!(downcast::<SignedMessage>(message).unwrap().value, -42);

    // Any payload bit flip must fail the signature check.
    let mut tampered = frame.clone();
    let payload_at = tempest_proto::constants::BASE_HEADER_LEN;
    tampered[payload_at] ^= 0x80;
    let mut state = HeaderState::new();
    assert!(matches!(
        receiver.try_read_header(&mut state, &tampered),
        HeaderPoll::Complete
    ));
    let (mut header, message) = state.finish();
    let err = receiver
        .read_payload(&mut header, message, &tampered)
        .unwrap_err();
    assert_eq!(
        err.disposition(),
        ConnectionResult::MessageAuthenticationFailed
    );
}
