// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol-specific session state.
//!
//! The session holds protocol behaviour behind a tagged variant keyed by
//! the protocol module selected at listener creation. All protocol-
//! conditional logic lives in the variant's methods; nothing downcasts.

use crate::protocol::constants::{
    SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_RO_TRX, SERVER_STATUS_IN_TRX,
};
use crate::protocol::{Command, Packet};

/// Transaction state as tracked from statements and server status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum TrxState {
    #[default]
    None,
    /// A transaction-opening statement was routed; not yet confirmed by
    /// the server status.
    Starting,
    Active,
    /// A COMMIT/ROLLBACK is in flight.
    Ending,
}

/// Protocol data for MySQL/MariaDB client sessions.
#[derive(Debug, Default)]
pub struct MariaDbData {
    /// Combined 64-bit capability word; MariaDB extended bits in the
    /// upper half.
    pub client_caps: u64,

    trx: TrxState,
    trx_read_only: bool,
    autocommit: bool,
    multi_statements: bool,

    /// A LOAD DATA LOCAL INFILE stream is in flight; raw data packets
    /// follow that must stream through unchanged.
    local_infile: bool,

    history_recoverable: bool,
}

impl MariaDbData {
    pub fn new(client_caps: u64) -> Self {
        Self {
            client_caps,
            autocommit: true,
            multi_statements: client_caps & crate::protocol::caps::MULTI_STATEMENTS != 0,
            history_recoverable: true,
            ..Self::default()
        }
    }

    /// Track a client statement before routing.
    fn track_query(&mut self, packet: &Packet) {
        if self.local_infile {
            // Raw file data, terminated by an empty packet.
            if packet.payload_len() == 0 {
                self.local_infile = false;
            }
            return;
        }

        if packet.command().ok() != Some(Command::Query) {
            return;
        }
        let sql = String::from_utf8_lossy(&packet.payload()[1..]);
        let sql = sql.trim_start();

        if starts_with_ci(sql, "BEGIN") || starts_with_ci(sql, "START TRANSACTION") {
            self.trx = TrxState::Starting;
            self.trx_read_only = contains_ci(sql, "READ ONLY");
        } else if starts_with_ci(sql, "COMMIT") || starts_with_ci(sql, "ROLLBACK") {
            if self.trx != TrxState::None {
                self.trx = TrxState::Ending;
            }
        } else if starts_with_ci(sql, "SET") {
            if let Some(value) = parse_set_autocommit(sql) {
                self.autocommit = value;
                if !value && self.trx == TrxState::None {
                    // autocommit=0 opens an implicit transaction.
                    self.trx = TrxState::Starting;
                }
            }
        } else if self.trx == TrxState::Starting {
            self.trx = TrxState::Active;
        }
    }

    /// Track the server status word of an OK/EOF reply.
    fn track_reply_status(&mut self, status: u16) {
        if status & SERVER_STATUS_IN_TRX != 0 {
            self.trx = TrxState::Active;
            self.trx_read_only = status & SERVER_STATUS_IN_RO_TRX != 0;
        } else if matches!(self.trx, TrxState::Ending | TrxState::Active) {
            self.trx = TrxState::None;
            self.trx_read_only = false;
        }
        self.autocommit = status & SERVER_STATUS_AUTOCOMMIT != 0;
    }

    fn begin_local_infile(&mut self) {
        self.local_infile = true;
    }
}

/// Tagged protocol-data variant. The MySQL/MariaDB implementation is the
/// one the proxy ships; the seam exists so a listener can select another.
#[derive(Debug)]
pub enum ProtocolData {
    MariaDb(MariaDbData),
}

impl ProtocolData {
    pub fn maria_db(client_caps: u64) -> Self {
        ProtocolData::MariaDb(MariaDbData::new(client_caps))
    }

    fn inner(&self) -> &MariaDbData {
        match self {
            ProtocolData::MariaDb(data) => data,
        }
    }

    fn inner_mut(&mut self) -> &mut MariaDbData {
        match self {
            ProtocolData::MariaDb(data) => data,
        }
    }

    /// Whether the server will reply to this client packet.
    pub fn will_respond(&self, packet: &Packet) -> bool {
        match packet.command() {
            Ok(cmd) => cmd.will_respond(),
            Err(_) => false,
        }
    }

    /// True while the session state can be rebuilt on a fresh backend:
    /// the session-command history is complete in memory, or pruned-
    /// history recovery is allowed.
    pub fn can_recover_state(&self) -> bool {
        self.inner().history_recoverable
    }

    pub fn set_history_recoverable(&mut self, recoverable: bool) {
        self.inner_mut().history_recoverable = recoverable;
    }

    pub fn is_trx_active(&self) -> bool {
        matches!(
            self.inner().trx,
            TrxState::Active | TrxState::Starting | TrxState::Ending
        )
    }

    pub fn is_trx_read_only(&self) -> bool {
        self.inner().trx_read_only
    }

    pub fn is_trx_starting(&self) -> bool {
        self.inner().trx == TrxState::Starting
    }

    pub fn is_trx_ending(&self) -> bool {
        self.inner().trx == TrxState::Ending
    }

    pub fn is_autocommit(&self) -> bool {
        self.inner().autocommit
    }

    pub fn are_multi_statements_allowed(&self) -> bool {
        self.inner().multi_statements
    }

    pub fn is_local_infile_active(&self) -> bool {
        self.inner().local_infile
    }

    pub fn client_caps(&self) -> u64 {
        self.inner().client_caps
    }

    pub fn track_query(&mut self, packet: &Packet) {
        self.inner_mut().track_query(packet);
    }

    pub fn track_reply_status(&mut self, status: u16) {
        self.inner_mut().track_reply_status(status);
    }

    pub fn begin_local_infile(&mut self) {
        self.inner_mut().begin_local_infile();
    }
}

fn starts_with_ci(text: &str, prefix: &str) -> bool {
    text.len() >= prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn contains_ci(text: &str, needle: &str) -> bool {
    let needle = needle.to_ascii_uppercase();
    text.to_ascii_uppercase().contains(&needle)
}

/// Parse `SET [SESSION|GLOBAL] autocommit = <value>`; returns the value
/// if the statement sets autocommit.
fn parse_set_autocommit(sql: &str) -> Option<bool> {
    let rest = sql[3..].trim_start();
    let rest = if starts_with_ci(rest, "SESSION") {
        rest[7..].trim_start()
    } else if starts_with_ci(rest, "GLOBAL") {
        rest[6..].trim_start()
    } else {
        rest
    };

    if !starts_with_ci(rest, "AUTOCOMMIT") {
        return None;
    }
    let rest = rest[10..].trim_start().strip_prefix('=')?.trim_start();

    if starts_with_ci(rest, "1") || starts_with_ci(rest, "ON") || starts_with_ci(rest, "TRUE") {
        Some(true)
    } else if starts_with_ci(rest, "0")
        || starts_with_ci(rest, "OFF")
        || starts_with_ci(rest, "FALSE")
    {
        Some(false)
    } else {
        None
    }
}
