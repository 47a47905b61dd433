mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use common::EchoMessage;
use tempest::dispatch::{ConnectionTx, Dispatcher, ExecutionMode, MessageEvent};
use tempest::message::{ConnectionId, MessageHeader, MessageId};
use tempest::reliable::MessageIdAllocator;

fn event(connection: i32, id: i32, text: &str, tx: &ConnectionTx) -> MessageEvent {
    let header = MessageHeader {
        protocol_id: common::TEST_PROTOCOL,
        message_type: common::ECHO_TYPE,
        message_id: MessageId(id),
        ..MessageHeader::default()
    };
    MessageEvent::new(
        ConnectionId(connection),
        header,
        Box::new(EchoMessage::new(text)),
        tx.clone(),
    )
}

fn connection_tx() -> ConnectionTx {
    let (tx, _rx) = mpsc::unbounded_channel();
    ConnectionTx::new(tx, Arc::new(Mutex::new(MessageIdAllocator::new())), false)
}

#[tokio::test]
async fn per_connection_mode_runs_handlers_inline() {
    let dispatcher = Dispatcher::new(ExecutionMode::PerConnection);
    let seen: Arc<Mutex<Vec<(i32, i32)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        dispatcher.register(common::TEST_PROTOCOL, common::ECHO_TYPE, move |event| {
            seen.lock()
                .push((event.connection_id.0, event.header.message_id.0));
        });
    }

    let tx = connection_tx();
    dispatcher.dispatch(event(1, 1, "a", &tx));
    dispatcher.dispatch(event(1, 2, "b", &tx));
    dispatcher.dispatch(event(2, 1, "c", &tx));

    // Inline invocation: everything observed already, in call order.
    assert_eq!(*seen.lock(), vec![(1, 1), (1, 2), (2, 1)]);
}

#[tokio::test]
async fn unhandled_messages_are_ignored() {
    let dispatcher = Dispatcher::new(ExecutionMode::PerConnection);
    let tx = connection_tx();
    // No handler registered; must not panic.
    dispatcher.dispatch(event(1, 1, "nobody home", &tx));
}

#[tokio::test]
async fn global_mode_preserves_total_order_across_connections() {
    let dispatcher = Dispatcher::new(ExecutionMode::GlobalOrder);
    let seen: Arc<Mutex<Vec<(i32, i32)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        dispatcher.register(common::TEST_PROTOCOL, common::ECHO_TYPE, move |event| {
            seen.lock()
                .push((event.connection_id.0, event.header.message_id.0));
        });
    }

    let tx = connection_tx();
    let expected: Vec<(i32, i32)> = (0..50)
        .map(|i| ((i % 3) + 1, i / 3 + 1))
        .collect();
    for &(connection, id) in &expected {
        dispatcher.dispatch(event(connection, id, "m", &tx));
    }

    // The single consumer drains the queue in enqueue order.
    for _ in 0..100 {
        if seen.lock().len() == expected.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*seen.lock(), expected);
}

#[tokio::test]
async fn handler_replies_travel_the_outbound_queue() {
    let dispatcher = Dispatcher::new(ExecutionMode::PerConnection);
    dispatcher.register(common::TEST_PROTOCOL, common::ECHO_TYPE, move |event| {
        event
            .respond(Box::new(EchoMessage::new("reply")))
            .expect("respond");
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let tx = ConnectionTx::new(tx, Arc::new(Mutex::new(MessageIdAllocator::new())), false);
    dispatcher.dispatch(event(1, 5, "ask", &tx));

    let queued = rx.recv().await.expect("queued outbound");
    match queued {
        tempest::dispatch::Outbound::Message { frame_id, .. } => match frame_id {
            tempest::dispatch::FrameId::ResponseTo(id) => assert_eq!(id, MessageId(5)),
            other => panic!("expected response frame id, got {other:?}"),
        },
        _ => panic!("expected message outbound"),
    }
}
