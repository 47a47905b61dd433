//! Reliable delivery over unordered datagrams: id allocation, the
//! in-order release queue, and the pending-acknowledgement set that
//! feeds retransmission.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use tempest_proto::constants::{MESSAGE_ID_HALF_WINDOW, RELIABLE_WINDOW};

use crate::message::MessageId;

/// Allocates reliable message ids: `1..MAX_MESSAGE_ID`, wrapping and
/// skipping the reserved 0.
#[derive(Debug)]
pub struct MessageIdAllocator {
    next: MessageId,
}

impl Default for MessageIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageIdAllocator {
    pub fn new() -> Self {
        MessageIdAllocator {
            next: MessageId(1),
        }
    }

    /// The id that will be handed out next, without consuming it.
    pub fn peek(&self) -> MessageId {
        self.next
    }

    pub fn allocate(&mut self) -> MessageId {
        let id = self.next;
        self.next = self.next.next();
        id
    }
}

/// Outcome of offering a reliable message to the queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueue<T> {
    /// The message and any contiguous run behind it, in order.
    Released(Vec<(MessageId, T)>),
    /// Parked until the gap before it fills.
    Stored,
    /// Already seen (or behind the release point); dropped.
    Duplicate,
    /// Implausibly far ahead of the release point; dropped without
    /// side effects.
    Rejected,
}

/// Per-connection ordered buffer turning the unordered ACKed datagram
/// stream into an in-order message sequence.
///
/// Invariant: after every enqueue, the slot at the front is either
/// unoccupied or holds the id directly after `last_in_order`; releases
/// advance `last_in_order` monotonically through the wrapping id space.
#[derive(Debug)]
pub struct ReliableQueue<T> {
    last_in_order: MessageId,
    slots: VecDeque<Option<T>>,
}

impl<T> Default for ReliableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReliableQueue<T> {
    pub fn new() -> Self {
        ReliableQueue {
            last_in_order: MessageId(0),
            slots: VecDeque::new(),
        }
    }

    pub fn last_in_order(&self) -> MessageId {
        self.last_in_order
    }

    /// Messages parked waiting for earlier ids.
    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn enqueue(&mut self, id: MessageId, item: T) -> Enqueue<T> {
        let gap = id.forward_gap(self.last_in_order);
        if gap == 0 || gap > MESSAGE_ID_HALF_WINDOW {
            trace!(%id, last = %self.last_in_order, "duplicate reliable message");
            return Enqueue::Duplicate;
        }
        if gap > RELIABLE_WINDOW {
            debug!(%id, last = %self.last_in_order, gap, "reliable id too far ahead, rejecting");
            return Enqueue::Rejected;
        }
        if gap == 1 {
            let mut released = Vec::with_capacity(1);
            self.last_in_order = id;
            released.push((id, item));
            // The front slot was reserved for this id.
            if !self.slots.is_empty() {
                self.slots.pop_front();
            }
            while let Some(Some(_)) = self.slots.front() {
                let next = self
                    .slots
                    .pop_front()
                    .flatten()
                    .expect("front checked occupied");
                self.last_in_order = self.last_in_order.next();
                released.push((self.last_in_order, next));
            }
            return Enqueue::Released(released);
        }

        let index = (gap - 1) as usize;
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        if self.slots[index].is_some() {
            trace!(%id, "reliable message already parked");
            return Enqueue::Duplicate;
        }
        self.slots[index] = Some(item);
        Enqueue::Stored
    }
}

/// A sent-but-unacknowledged reliable message.
#[derive(Debug, Clone)]
struct PendingEntry {
    sent_at: Instant,
    frame: Vec<u8>,
}

/// Map of reliable messages awaiting acknowledgement, shared by the
/// send path and the retransmit timer.
#[derive(Debug, Default)]
pub struct PendingAck {
    entries: HashMap<i32, PendingEntry>,
}

impl PendingAck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.entries.contains_key(&id.0)
    }

    /// Records an outbound frame until its id is acknowledged.
    pub fn insert(&mut self, id: MessageId, frame: Vec<u8>, now: Instant) {
        self.entries.insert(id.0, PendingEntry { sent_at: now, frame });
    }

    /// Removes every acknowledged id, returning how many were live.
    pub fn acknowledge(&mut self, ids: &[i32]) -> usize {
        let mut removed = 0;
        for id in ids {
            if self.entries.remove(id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Frames unacknowledged for at least `older_than`, their send
    /// times reset to `now`. Each is retransmitted with its original
    /// message id.
    pub fn take_due(&mut self, now: Instant, older_than: Duration) -> Vec<(MessageId, Vec<u8>)> {
        let mut due = Vec::new();
        for (&id, entry) in self.entries.iter_mut() {
            if now.saturating_duration_since(entry.sent_at) >= older_than {
                entry.sent_at = now;
                due.push((MessageId(id), entry.frame.clone()));
            }
        }
        due
    }

    /// Drops everything; used at teardown.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
