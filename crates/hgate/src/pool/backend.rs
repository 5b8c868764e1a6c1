// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Backend connection.
//!
//! A `BackendConn` wraps one proxy-to-server connection: the socket, the
//! protocol state needed to decide whether the connection can be pooled
//! and how well it matches a new session, and the read/write staging
//! buffers. A connection is owned by exactly one session, sits in exactly
//! one per-worker pool, or is in transit through a destroy queue - never
//! two of those at once.

use crate::protocol::FrameDecoder;
use crate::server::{Server, ServerId};
use mio::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// How well a pooled connection matches a session asking for one.
///
/// Ordered: a linear pool scan keeps the best candidate and short-circuits
/// on [`ReuseQuality::Optimal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReuseQuality {
    NotPossible,
    Partial,
    Optimal,
}

/// Identity a connection was authenticated as; reuse quality compares the
/// asking session against this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnIdentity {
    pub user: String,
    pub default_db: String,
}

/// One proxy-to-backend connection.
#[derive(Debug)]
pub struct BackendConn {
    id: u64,
    server: Arc<Server>,

    /// The socket; `None` for a detached connection, which stages writes
    /// without a transport (tests, and endpoints mid-reconnect).
    stream: Option<TcpStream>,

    identity: ConnIdentity,

    created: Instant,
    last_read: Instant,

    polling: bool,
    hanged_up: bool,
    established: bool,
    /// Index into the session-command history up to which this connection
    /// has been replayed.
    history_pos: u64,

    decoder: FrameDecoder,
    write_buf: Vec<u8>,
}

impl BackendConn {
    pub fn new(server: Arc<Server>, identity: ConnIdentity, stream: Option<TcpStream>) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            server,
            stream,
            identity,
            created: now,
            last_read: now,
            polling: false,
            hanged_up: false,
            established: false,
            history_pos: 0,
            decoder: FrameDecoder::new(),
            write_buf: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn server_id(&self) -> ServerId {
        self.server.id()
    }

    pub fn identity(&self) -> &ConnIdentity {
        &self.identity
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn last_read(&self) -> Instant {
        self.last_read
    }

    pub fn mark_read(&mut self) {
        self.last_read = Instant::now();
    }

    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    pub fn decoder_mut(&mut self) -> &mut FrameDecoder {
        &mut self.decoder
    }

    /// Bytes staged for the next writable event.
    pub fn write_buf(&mut self) -> &mut Vec<u8> {
        &mut self.write_buf
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn set_polling(&mut self, polling: bool) {
        self.polling = polling;
    }

    pub fn hanged_up(&self) -> bool {
        self.hanged_up
    }

    pub fn set_hanged_up(&mut self) {
        self.hanged_up = true;
    }

    /// Protocol handshake and authentication completed.
    pub fn established(&self) -> bool {
        self.established
    }

    pub fn set_established(&mut self) {
        self.established = true;
    }

    pub fn history_pos(&self) -> u64 {
        self.history_pos
    }

    pub fn set_history_pos(&mut self, pos: u64) {
        self.history_pos = pos;
    }

    /// No response is pending and the write buffer has drained; closing
    /// now loses nothing.
    pub fn can_close(&self) -> bool {
        self.write_buf.is_empty()
    }

    /// Match quality against a session identity: same user and default
    /// schema is optimal, same user alone needs a schema change, another
    /// user cannot reuse the connection at all.
    pub fn can_reuse(&self, identity: &ConnIdentity) -> ReuseQuality {
        if self.identity.user != identity.user {
            ReuseQuality::NotPossible
        } else if self.identity.default_db != identity.default_db {
            ReuseQuality::Partial
        } else {
            ReuseQuality::Optimal
        }
    }

    /// Reset per-session state when the connection changes hands. A
    /// partial reuse re-selects the default schema, so the history replay
    /// position rewinds.
    pub fn prepare_reuse(&mut self, identity: ConnIdentity, quality: ReuseQuality) -> bool {
        match quality {
            ReuseQuality::NotPossible => false,
            ReuseQuality::Partial | ReuseQuality::Optimal => {
                self.identity = identity;
                self.history_pos = 0;
                self.decoder.reset();
                true
            }
        }
    }
}
