// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transaction replay.
//!
//! While a transaction is open, the statements routed to its backend are
//! buffered together with the checksum of the first response packet of
//! each result set. If the backend dies mid-transaction, a router may
//! replay the buffer on a fresh backend and compare checksums to detect
//! divergence. Replay is best-effort by contract: the checksum makes a
//! divergent replay detectable, not impossible.

use crate::protocol::Packet;
use crate::routing::fnv1a_64;

/// Replay policy knobs, per service.
#[derive(Debug, Clone, Copy)]
pub struct ReplayPolicy {
    /// Master switch for transaction replay.
    pub transaction_replay: bool,
    /// When the connection was lost while a COMMIT was in flight, the
    /// outcome is unknowable. `true` fails the transaction to the client;
    /// `false` replays the COMMIT at the risk of committing twice.
    pub transaction_replay_safe_commit: bool,
    /// Cap on buffered statement bytes; an oversized transaction stops
    /// being replayable.
    pub max_size: usize,
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self {
            transaction_replay: false,
            transaction_replay_safe_commit: true,
            max_size: 1024 * 1024,
        }
    }
}

/// Decision for a lost-backend event during a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDecision {
    /// Re-issue the buffered statements on a new backend.
    Replay,
    /// Fail the transaction to the client with an ERR packet.
    Fail,
}

/// One buffered statement and the checksum of its observed result.
#[derive(Debug, Clone)]
pub struct ReplayedStatement {
    pub packet: Packet,
    /// Checksum of the first response packet; `None` until the response
    /// arrived.
    pub checksum: Option<u64>,
}

/// Statement buffer of the currently open transaction.
#[derive(Debug, Default)]
pub struct TrxRecorder {
    statements: Vec<ReplayedStatement>,
    size: usize,
    oversized: bool,
    /// The statement whose response is pending, if any.
    awaiting: Option<usize>,
}

impl TrxRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a statement routed within the transaction.
    pub fn record(&mut self, packet: &Packet, policy: &ReplayPolicy) {
        self.size += packet.as_wire().len();
        if self.size > policy.max_size {
            self.oversized = true;
            self.statements.clear();
            return;
        }
        if !self.oversized {
            self.statements.push(ReplayedStatement {
                packet: packet.clone(),
                checksum: None,
            });
            self.awaiting = Some(self.statements.len() - 1);
        }
    }

    /// Record the first response packet of the current statement.
    pub fn record_response(&mut self, payload: &[u8]) {
        if let Some(index) = self.awaiting.take() {
            if let Some(stmt) = self.statements.get_mut(index) {
                stmt.checksum = Some(fnv1a_64(payload));
            }
        }
    }

    /// A statement has been routed but its response has not completed.
    pub fn response_pending(&self) -> bool {
        self.awaiting.is_some()
    }

    pub fn statements(&self) -> &[ReplayedStatement] {
        &self.statements
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The buffer can reproduce the transaction.
    pub fn is_replayable(&self) -> bool {
        !self.oversized
    }

    /// Close out the transaction; the buffer resets for the next one.
    pub fn clear(&mut self) {
        self.statements.clear();
        self.size = 0;
        self.oversized = false;
        self.awaiting = None;
    }

    /// Decide what to do after the transaction's backend was lost.
    ///
    /// `commit_in_flight` is true when the lost response was for a
    /// COMMIT. With `transaction_replay_safe_commit` set the commit is
    /// never replayed; otherwise it is, at the documented risk of a
    /// double commit.
    pub fn on_backend_lost(
        &self,
        policy: &ReplayPolicy,
        commit_in_flight: bool,
    ) -> ReplayDecision {
        if !policy.transaction_replay || !self.is_replayable() {
            return ReplayDecision::Fail;
        }
        if commit_in_flight && policy.transaction_replay_safe_commit {
            return ReplayDecision::Fail;
        }
        ReplayDecision::Replay
    }

    /// Compare a replayed statement's first response against the original
    /// checksum. A mismatch means the replay diverged and must abort.
    pub fn verify_replayed_response(&self, index: usize, payload: &[u8]) -> bool {
        match self.statements.get(index).and_then(|stmt| stmt.checksum) {
            Some(original) => original == fnv1a_64(payload),
            // No recorded response to compare against.
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(sql: &str) -> Packet {
        let mut payload = vec![0x03];
        payload.extend_from_slice(sql.as_bytes());
        Packet::from_payload(0, &payload)
    }

    fn policy(replay: bool, safe_commit: bool) -> ReplayPolicy {
        ReplayPolicy {
            transaction_replay: replay,
            transaction_replay_safe_commit: safe_commit,
            max_size: 1024,
        }
    }

    #[test]
    fn test_record_and_checksum() {
        let mut rec = TrxRecorder::new();
        let p = policy(true, true);

        rec.record(&query("BEGIN"), &p);
        assert!(rec.response_pending());
        rec.record_response(&[0x00, 0x00, 0x00, 0x02, 0x00]);
        assert!(!rec.response_pending());

        rec.record(&query("INSERT INTO t VALUES (1)"), &p);
        rec.record_response(&[0x00, 0x01, 0x00, 0x02, 0x00]);

        assert_eq!(rec.statements().len(), 2);
        assert!(rec.statements().iter().all(|s| s.checksum.is_some()));

        // Identical replay verifies; a divergent response does not.
        assert!(rec.verify_replayed_response(1, &[0x00, 0x01, 0x00, 0x02, 0x00]));
        assert!(!rec.verify_replayed_response(1, &[0xff, 0x15, 0x04]));
    }

    #[test]
    fn test_safe_commit_gate() {
        let mut rec = TrxRecorder::new();
        rec.record(&query("BEGIN"), &policy(true, true));

        // Safe commit: a COMMIT lost in flight fails the transaction.
        assert_eq!(
            rec.on_backend_lost(&policy(true, true), true),
            ReplayDecision::Fail
        );
        // Unsafe commit: the COMMIT is replayed.
        assert_eq!(
            rec.on_backend_lost(&policy(true, false), true),
            ReplayDecision::Replay
        );
        // Not mid-COMMIT: replay either way.
        assert_eq!(
            rec.on_backend_lost(&policy(true, true), false),
            ReplayDecision::Replay
        );
        // Replay disabled entirely.
        assert_eq!(
            rec.on_backend_lost(&policy(false, false), false),
            ReplayDecision::Fail
        );
    }

    #[test]
    fn test_oversized_transaction_not_replayable() {
        let mut rec = TrxRecorder::new();
        let p = policy(true, true);
        rec.record(&query(&"x".repeat(2048)), &p);

        assert!(!rec.is_replayable());
        assert_eq!(rec.on_backend_lost(&p, false), ReplayDecision::Fail);

        rec.clear();
        assert!(rec.is_replayable());
    }
}
