// SPDX-License-Identifier: MIT OR Apache-2.0
//! Duplicate suppression keyed on `(client_id, sequence_id)`.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::Envelope;

/// Default number of sequence ids remembered per client.
pub const DEFAULT_WINDOW: usize = 256;

/// Per-client sliding window of recently seen sequence ids.
///
/// Two envelopes with equal `(client_id, sequence_id)` are idempotent
/// duplicates when `sequence_id` is set; the second and later sightings
/// must be dropped by the caller. Envelopes without a sequence id are
/// never considered duplicates.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    seen: HashMap<String, ClientWindow>,
}

#[derive(Debug, Default)]
struct ClientWindow {
    order: VecDeque<u64>,
    set: HashSet<u64>,
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl DedupWindow {
    /// Create a window remembering up to `capacity` ids per client.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashMap::new(),
        }
    }

    /// Record the envelope and report whether it is a duplicate.
    ///
    /// Returns `true` when this `(client_id, sequence_id)` pair was already
    /// observed inside the window.
    pub fn observe(&mut self, envelope: &Envelope) -> bool {
        let (Some(client_id), Some(seq)) = (&envelope.client_id, envelope.sequence_id) else {
            return false;
        };
        let window = self.seen.entry(client_id.clone()).or_default();
        if window.set.contains(&seq) {
            return true;
        }
        window.order.push_back(seq);
        window.set.insert(seq);
        if window.order.len() > self.capacity
            && let Some(evicted) = window.order.pop_front()
        {
            window.set.remove(&evicted);
        }
        false
    }

    /// Drop all remembered ids for a departing client.
    pub fn forget_client(&mut self, client_id: &str) {
        self.seen.remove(client_id);
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.seen.len()
    }
}
