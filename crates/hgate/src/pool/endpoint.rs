// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server endpoint: a session's routing target on one backend server.
//!
//! Router sessions hold one endpoint per candidate server. The endpoint
//! acquires its backend connection lazily through the worker's pool group,
//! queueing on the admission waiting list when the server's connection cap
//! is reached.

use super::backend::{BackendConn, ConnIdentity, ReuseQuality};
use super::PoolGroup;
use crate::protocol::Packet;
use crate::server::{Server, ServerId};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A connection is attached; writes will flow.
    Connected(ReuseQuality),
    /// The server's cap is reached; the endpoint is queued and will be
    /// retried when a slot frees, or failed on multiplex timeout.
    Queued,
    /// The server is down.
    Failed,
}

#[derive(Debug)]
enum EndpointState {
    Closed,
    Waiting { since: Instant },
    Open(Box<BackendConn>),
}

/// One session-to-server routing endpoint.
pub struct ServerEndpoint {
    session_id: u64,
    server: Arc<Server>,
    pools: Arc<PoolGroup>,
    identity: ConnIdentity,
    multiplex_timeout: Duration,
    state: EndpointState,
}

impl ServerEndpoint {
    pub fn new(
        session_id: u64,
        server: Arc<Server>,
        pools: Arc<PoolGroup>,
        identity: ConnIdentity,
        multiplex_timeout: Duration,
    ) -> Self {
        Self {
            session_id,
            server,
            pools,
            identity,
            multiplex_timeout,
            state: EndpointState::Closed,
        }
    }

    pub fn target(&self) -> ServerId {
        self.server.id()
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, EndpointState::Open(_))
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.state, EndpointState::Waiting { .. })
    }

    /// How long the endpoint has been queued for admission.
    pub fn conn_wait(&self) -> Option<Duration> {
        match self.state {
            EndpointState::Waiting { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    /// Acquire a backend connection: pool first, then a fresh connection
    /// within the server's cap, else join the admission queue.
    pub fn connect(&mut self) -> ConnectOutcome {
        if self.is_open() {
            return ConnectOutcome::Connected(ReuseQuality::Optimal);
        }
        if !self.server.is_running() {
            return ConnectOutcome::Failed;
        }

        let result = self.pools.get_backend_connection(&self.server, &self.identity);
        if let Some((quality, conn)) = result.conn {
            if self.is_waiting() {
                self.pools.remove_waiter(self.server.id(), self.session_id);
            }
            self.state = EndpointState::Open(Box::new(conn));
            return ConnectOutcome::Connected(quality);
        }

        if result.conn_limit_reached {
            if !self.is_waiting() {
                self.pools.enqueue_waiter(
                    self.server.id(),
                    self.session_id,
                    self.multiplex_timeout,
                );
                self.state = EndpointState::Waiting {
                    since: Instant::now(),
                };
            }
            ConnectOutcome::Queued
        } else {
            ConnectOutcome::Failed
        }
    }

    /// Stage a packet for the backend. The worker flushes staged bytes on
    /// the next writable event.
    pub fn write(&mut self, packet: &Packet) -> Result<(), crate::Error> {
        match &mut self.state {
            EndpointState::Open(conn) => {
                conn.write_buf().extend_from_slice(packet.as_wire());
                Ok(())
            }
            _ => Err(crate::Error::BackendNotConnected(self.server.id())),
        }
    }

    pub fn conn(&self) -> Option<&BackendConn> {
        match &self.state {
            EndpointState::Open(conn) => Some(conn),
            _ => None,
        }
    }

    pub fn conn_mut(&mut self) -> Option<&mut BackendConn> {
        match &mut self.state {
            EndpointState::Open(conn) => Some(conn),
            _ => None,
        }
    }

    /// Detach the connection, e.g. to hand it back to the pool.
    pub fn take_conn(&mut self) -> Option<BackendConn> {
        match std::mem::replace(&mut self.state, EndpointState::Closed) {
            EndpointState::Open(conn) => Some(*conn),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Close the endpoint. The connection, if any, is returned so the
    /// caller can pool or destroy it; the admission queue entry is
    /// dropped.
    pub fn close(&mut self) -> Option<BackendConn> {
        if self.is_waiting() {
            self.pools.remove_waiter(self.server.id(), self.session_id);
        }
        match std::mem::replace(&mut self.state, EndpointState::Closed) {
            EndpointState::Open(conn) => {
                self.server.stats().remove_connection();
                Some(*conn)
            }
            _ => None,
        }
    }
}
