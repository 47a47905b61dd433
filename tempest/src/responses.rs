//! Request/response correlation: futures keyed by outbound message id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::Error;
use crate::message::{Message, MessageHeader, MessageId};

/// A completed response: the inbound header and parsed message.
pub struct Response {
    pub header: MessageHeader,
    pub message: Box<dyn Message>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("header", &self.header)
            .field("message", &"Box<dyn Message>")
            .finish()
    }
}

/// Future side of a registered response slot.
pub struct ResponseFuture {
    id: MessageId,
    rx: oneshot::Receiver<Result<Response, Error>>,
}

impl ResponseFuture {
    pub fn message_id(&self) -> MessageId {
        self.id
    }

    /// Waits for the paired response. Resolves with [`Error::Timeout`]
    /// when the deadline fires first and [`Error::Cancelled`] when the
    /// connection tears down.
    pub async fn wait(self) -> Result<Response, Error> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        }
    }
}

#[derive(Default)]
struct Slots {
    pending: HashMap<i32, oneshot::Sender<Result<Response, Error>>>,
}

/// Shared registry of in-flight response futures for one connection.
///
/// The sender registers before the frame is written so a fast peer
/// cannot win the race; inbound response frames complete exactly the
/// future with their id.
#[derive(Clone, Default)]
pub struct ResponseManager {
    slots: Arc<Mutex<Slots>>,
}

impl ResponseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot for `id`. With a timeout, a task cancels the
    /// future if no response arrives in time.
    pub fn register(&self, id: MessageId, timeout: Option<Duration>) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().pending.insert(id.0, tx);

        if let Some(timeout) = timeout {
            let slots = self.slots.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(tx) = slots.lock().pending.remove(&id.0) {
                    trace!(id = id.0, "response timed out");
                    let _ = tx.send(Err(Error::Timeout));
                }
            });
        }

        ResponseFuture { id, rx }
    }

    /// Completes the future registered under the inbound response's id,
    /// if any. Returns whether a waiter existed.
    pub fn complete(&self, header: MessageHeader, message: Box<dyn Message>) -> bool {
        let id = header.message_id;
        let Some(tx) = self.slots.lock().pending.remove(&id.0) else {
            trace!(id = id.0, "response with no waiting future");
            return false;
        };
        tx.send(Ok(Response { header, message })).is_ok()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().pending.is_empty()
    }

    /// Cancels every outstanding future; used at teardown.
    pub fn cancel_all(&self) {
        let mut slots = self.slots.lock();
        for (_, tx) in slots.pending.drain() {
            let _ = tx.send(Err(Error::Cancelled));
        }
    }
}

impl std::fmt::Debug for ResponseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseManager")
            .field("pending", &self.len())
            .finish()
    }
}
