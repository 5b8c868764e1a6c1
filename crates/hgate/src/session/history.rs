// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session-command history.
//!
//! An ordered, bounded record of the statements that altered session
//! state (USE, SET, prepared-statement preparation and the like). When a
//! backend connection is created or resurrected mid-session, the router
//! replays this history before resuming normal routing, so the new
//! connection observes the same session state the client built up.

use crate::protocol::Packet;

/// One recorded session command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Monotonic position within this session, 1-based. Backend
    /// connections remember the position they have replayed up to.
    pub position: u64,
    pub packet: Packet,
}

/// Bounded session-command history.
#[derive(Debug)]
pub struct SessionHistory {
    entries: Vec<HistoryEntry>,
    max_len: usize,
    next_position: u64,
    /// Entries have been pruned; a replay from position zero can no
    /// longer reproduce the full session state.
    pruned: bool,
}

impl SessionHistory {
    pub fn new(max_len: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_len,
            next_position: 1,
            pruned: false,
        }
    }

    /// Record a state-altering statement. Oldest entries are pruned past
    /// the bound, after which the history is marked incomplete.
    pub fn add(&mut self, packet: Packet) -> u64 {
        let position = self.next_position;
        self.next_position += 1;
        self.entries.push(HistoryEntry { position, packet });

        if self.entries.len() > self.max_len {
            self.entries.remove(0);
            self.pruned = true;
        }
        position
    }

    /// Entries a backend that replayed up to `from_position` still needs,
    /// in order.
    pub fn to_replay(&self, from_position: u64) -> &[HistoryEntry] {
        let start = self
            .entries
            .partition_point(|entry| entry.position <= from_position);
        &self.entries[start..]
    }

    /// The position a fully replayed backend ends up at.
    pub fn latest_position(&self) -> u64 {
        self.next_position - 1
    }

    /// The history is still complete in memory.
    pub fn is_complete(&self) -> bool {
        !self.pruned
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Heap bytes owned by the recorded packets.
    pub fn varying_size(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.packet.as_wire().len())
            .sum()
    }
}
