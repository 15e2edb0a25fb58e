// SPDX-License-Identifier: MIT OR Apache-2.0
//! Debounced save scheduling.
//!
//! The scheduler is passive state owned by the session loop: mutations mark
//! tables dirty, the loop sleeps until [`SaveScheduler::next_deadline`] and
//! then drains [`SaveScheduler::take_due`]. Bursts of mutations inside the
//! debounce window collapse into a single save per table.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

/// Tracks which tables have unsaved changes and when each save is due.
#[derive(Debug)]
pub struct SaveScheduler {
    debounce: Duration,
    pending: HashMap<Uuid, Instant>,
}

impl SaveScheduler {
    /// Scheduler collapsing saves inside `debounce`.
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending: HashMap::new(),
        }
    }

    /// Mark a table dirty.
    ///
    /// The first mark arms the deadline; further marks inside the window
    /// do not push it back, so a steady mutation stream still saves once
    /// per window rather than never.
    pub fn mark_dirty(&mut self, table_id: Uuid) {
        self.pending
            .entry(table_id)
            .or_insert_with(|| Instant::now() + self.debounce);
    }

    /// Remove and return every table whose deadline has passed.
    pub fn take_due(&mut self) -> Vec<Uuid> {
        let now = Instant::now();
        let due: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            self.pending.remove(id);
        }
        due
    }

    /// Remove and return every pending table regardless of deadline.
    pub fn take_all(&mut self) -> Vec<Uuid> {
        self.pending.drain().map(|(id, _)| id).collect()
    }

    /// Drop a pending save (table deleted before the save fired).
    pub fn cancel(&mut self, table_id: &Uuid) {
        self.pending.remove(table_id);
    }

    /// Earliest pending deadline, for the session loop's sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Number of tables with unsaved changes.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is waiting to be saved.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }
}
