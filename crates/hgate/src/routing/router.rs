// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Router contract.
//!
//! A router module is instantiated once per service with its config; it
//! produces one router session per client session. The router session
//! decides which backend endpoints receive each client packet and how
//! backend replies merge into the client-visible stream.
//!
//! The contract is wide enough to express the production strategies:
//! a mirror (one main backend forwarded, shadows compared by checksum,
//! replies held until all backends answered), schema sharding (statement
//! routed by referenced schema, LOAD DATA LOCAL streamed through
//! unchanged), and read/write split with transaction replay.

use super::reply::{Reply, ReplyRoute};
use crate::pool::ServerEndpoint;
use crate::protocol::Packet;
use crate::server::ServerId;
use crate::Error;

/// Why `handle_error` is being consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// The endpoint may work again later, e.g. a lost connection.
    Transient,
    /// The endpoint is unusable for the rest of the session.
    Permanent,
}

/// Factory for router sessions; one instance per service.
pub trait Router: Send + Sync {
    /// Create the per-client routing state over the session's candidate
    /// endpoints.
    fn make_session(
        &self,
        endpoints: Vec<ServerEndpoint>,
    ) -> Result<Box<dyn RouterSession>, Error>;

    /// Module name for diagnostics and the admin surface.
    fn name(&self) -> &str;
}

/// Per-client routing state.
pub trait RouterSession: Send {
    /// Route one client packet downstream. Returning `false` is fatal for
    /// the session.
    fn route_query(&mut self, packet: Packet) -> bool;

    /// Deliver one backend packet upstream. Returning `false` is fatal
    /// for the session.
    fn client_reply(&mut self, packet: Packet, route: &ReplyRoute, reply: &Reply) -> bool;

    /// A backend endpoint failed. Return `true` to keep the session
    /// alive (e.g. after a successful failover or replay), `false` to
    /// kill it with `HANDLE_ERROR_FAILED`.
    fn handle_error(
        &mut self,
        error_type: ErrorType,
        message: &str,
        failing: ServerId,
        reply: &Reply,
    ) -> bool;

    /// Packets the session should send to the client now. Drained by the
    /// session pipeline after each downstream/upstream call.
    fn take_client_output(&mut self) -> Vec<Packet>;

    /// Endpoints, for the worker to flush staged writes and pool released
    /// connections.
    fn endpoints_mut(&mut self) -> &mut [ServerEndpoint];
}

// ============================================================================
// Reference implementation
// ============================================================================

/// Minimal connection router: picks the first running endpoint at session
/// start and routes every packet there. The smallest strategy that
/// exercises the whole contract; also what the scaling and pooling tests
/// drive traffic through.
pub struct ReadConnRouter;

impl Router for ReadConnRouter {
    fn make_session(
        &self,
        endpoints: Vec<ServerEndpoint>,
    ) -> Result<Box<dyn RouterSession>, Error> {
        if endpoints.is_empty() {
            return Err(Error::NoBackendAvailable);
        }
        Ok(Box::new(ReadConnSession {
            endpoints,
            active: None,
            client_output: Vec::new(),
        }))
    }

    fn name(&self) -> &str {
        "readconnroute"
    }
}

struct ReadConnSession {
    endpoints: Vec<ServerEndpoint>,
    /// Index of the endpoint in use.
    active: Option<usize>,
    client_output: Vec<Packet>,
}

impl ReadConnSession {
    fn pick_endpoint(&mut self) -> Option<usize> {
        if let Some(index) = self.active {
            if self.endpoints[index].is_open() {
                return Some(index);
            }
        }
        for index in 0..self.endpoints.len() {
            if self.endpoints[index].server().is_running() {
                use crate::pool::ConnectOutcome;
                match self.endpoints[index].connect() {
                    ConnectOutcome::Connected(_) => {
                        self.active = Some(index);
                        return Some(index);
                    }
                    ConnectOutcome::Queued => {
                        // Admission queue will retry us; nothing routable
                        // right now.
                        return None;
                    }
                    ConnectOutcome::Failed => continue,
                }
            }
        }
        None
    }
}

impl RouterSession for ReadConnSession {
    fn route_query(&mut self, packet: Packet) -> bool {
        match self.pick_endpoint() {
            Some(index) => self.endpoints[index].write(&packet).is_ok(),
            None => false,
        }
    }

    fn client_reply(&mut self, packet: Packet, _route: &ReplyRoute, _reply: &Reply) -> bool {
        self.client_output.push(packet);
        true
    }

    fn handle_error(
        &mut self,
        error_type: ErrorType,
        message: &str,
        failing: ServerId,
        _reply: &Reply,
    ) -> bool {
        log::warn!("[ROUTER] endpoint {failing} failed: {message}");
        if let Some(index) = self.active {
            if self.endpoints[index].target() == failing {
                self.endpoints[index].close();
                self.active = None;
            }
        }
        // A transient error is survivable if another backend can take
        // over; a permanent one ends the session.
        error_type == ErrorType::Transient && self.pick_endpoint().is_some()
    }

    fn take_client_output(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.client_output)
    }

    fn endpoints_mut(&mut self) -> &mut [ServerEndpoint] {
        &mut self.endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ConnIdentity, PoolGroup};
    use crate::server::{Server, ServerAddress};
    use std::sync::Arc;
    use std::time::Duration;

    fn endpoint(session: u64, id: u32, pools: &Arc<PoolGroup>) -> ServerEndpoint {
        let server = Server::new(
            crate::server::ServerId(id),
            format!("db{id}"),
            ServerAddress::parse("127.0.0.1", 3306),
        );
        pools.register_server(Arc::clone(&server));
        ServerEndpoint::new(
            session,
            server,
            Arc::clone(pools),
            ConnIdentity {
                user: "app".into(),
                default_db: "shop".into(),
            },
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_routes_to_first_running() {
        let pools = Arc::new(PoolGroup::new());
        let down = endpoint(1, 1, &pools);
        down.server().set_running(false);
        let up = endpoint(1, 2, &pools);

        let router = ReadConnRouter;
        let mut session = router.make_session(vec![down, up]).unwrap();

        assert!(session.route_query(Packet::from_payload(0, &[0x0e])));
        let endpoints = session.endpoints_mut();
        assert!(!endpoints[0].is_open());
        assert!(endpoints[1].is_open());
    }

    #[test]
    fn test_transient_error_fails_over() {
        let pools = Arc::new(PoolGroup::new());
        let a = endpoint(1, 1, &pools);
        let b = endpoint(1, 2, &pools);

        let router = ReadConnRouter;
        let mut session = router.make_session(vec![a, b]).unwrap();
        assert!(session.route_query(Packet::from_payload(0, &[0x0e])));

        let keep = session.handle_error(
            ErrorType::Transient,
            "connection reset",
            crate::server::ServerId(1),
            &Reply::new(),
        );
        assert!(keep, "failover to db2 keeps the session alive");
        assert!(session.endpoints_mut()[1].is_open());

        let keep = session.handle_error(
            ErrorType::Permanent,
            "authentication rejected",
            crate::server::ServerId(2),
            &Reply::new(),
        );
        assert!(!keep);
    }

    #[test]
    fn test_replies_pass_through() {
        let pools = Arc::new(PoolGroup::new());
        let a = endpoint(1, 1, &pools);
        let router = ReadConnRouter;
        let mut session = router.make_session(vec![a]).unwrap();

        let packet = Packet::from_payload(1, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
        let route = ReplyRoute {
            source: crate::server::ServerId(1),
        };
        assert!(session.client_reply(packet.clone(), &route, &Reply::new()));
        assert_eq!(session.take_client_output(), vec![packet]);
        assert!(session.take_client_output().is_empty());
    }

    #[test]
    fn test_empty_endpoint_list_rejected() {
        assert!(ReadConnRouter.make_session(Vec::new()).is_err());
    }
}
