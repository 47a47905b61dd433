//! Fragmentation of oversized datagrams and reassembly of the partial
//! messages they arrive as.

use std::collections::HashMap;

use tracing::{debug, trace};

use tempest_proto::constants::UDP_FRAGMENT_PAYLOAD;

use crate::control::PartialMessage;
use crate::message::MessageId;

/// Splits a framed message into partial-message payloads of at most
/// [`UDP_FRAGMENT_PAYLOAD`] bytes. The caller assigns the first
/// fragment the original message id and fresh ids to the rest.
pub fn fragment(frame: &[u8], original_id: MessageId) -> Vec<PartialMessage> {
    let count = frame.len().div_ceil(UDP_FRAGMENT_PAYLOAD) as i32;
    frame
        .chunks(UDP_FRAGMENT_PAYLOAD)
        .map(|chunk| PartialMessage {
            original_message_id: original_id.0,
            count,
            data: chunk.to_vec(),
        })
        .collect()
}

pub fn needs_fragmenting(frame: &[u8]) -> bool {
    frame.len() > UDP_FRAGMENT_PAYLOAD
}

#[derive(Debug)]
struct Pool {
    count: usize,
    fragments: Vec<Vec<u8>>,
}

/// Reassembles partial messages per original message id.
///
/// Partials travel reliably, so the queue releases them in reliable-id
/// order; appending in release order concatenates the original frame.
#[derive(Debug)]
pub struct PartialAssembly {
    pools: HashMap<i32, Pool>,
    /// Upper bound on a reassembled message, inherited from the
    /// connection's configured maximum.
    max_message_size: usize,
}

impl PartialAssembly {
    pub fn new(max_message_size: usize) -> Self {
        PartialAssembly {
            pools: HashMap::new(),
            max_message_size,
        }
    }

    /// Accepts one partial. Returns the reconstructed frame when this
    /// was the last missing piece, `None` while incomplete, and drops
    /// inconsistent pools entirely.
    pub fn add(&mut self, partial: PartialMessage) -> Option<Vec<u8>> {
        let original_id = partial.original_message_id;
        let count = partial.count;
        if count <= 0 || count as usize > self.max_message_size.div_ceil(UDP_FRAGMENT_PAYLOAD) {
            debug!(original_id, count, "partial message with implausible count, dropping");
            self.pools.remove(&original_id);
            return None;
        }

        let pool = self.pools.entry(original_id).or_insert_with(|| Pool {
            count: count as usize,
            fragments: Vec::with_capacity(count as usize),
        });
        if pool.count != count as usize {
            debug!(original_id, "partial message count changed mid-stream, dropping");
            self.pools.remove(&original_id);
            return None;
        }

        pool.fragments.push(partial.data);
        trace!(
            original_id,
            received = pool.fragments.len(),
            total = pool.count,
            "partial message buffered"
        );

        if pool.fragments.len() == pool.count {
            let pool = self.pools.remove(&original_id).expect("pool exists");
            let total: usize = pool.fragments.iter().map(Vec::len).sum();
            if total > self.max_message_size {
                debug!(original_id, total, "reassembled message exceeds maximum, dropping");
                return None;
            }
            let mut frame = Vec::with_capacity(total);
            for piece in pool.fragments {
                frame.extend_from_slice(&piece);
            }
            return Some(frame);
        }
        None
    }

    /// Pools still waiting for fragments.
    pub fn incomplete(&self) -> usize {
        self.pools.len()
    }

    pub fn clear(&mut self) {
        self.pools.clear();
    }
}
