// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session lifecycle, kill reasons, and the transaction-replay
//! safe-commit gate.

use hgate::pool::{ConnIdentity, PoolGroup, ServerEndpoint};
use hgate::protocol::{err, Packet, ReplyKind};
use hgate::routing::{
    ErrorType, ReadConnRouter, Reply, ReplyRoute, Router, RouterSession,
};
use hgate::server::{Server, ServerAddress, ServerId};
use hgate::session::{
    KillReason, ReplayDecision, ReplayPolicy, Session, SessionConfig, SessionState, TrxRecorder,
};
use std::sync::Arc;
use std::time::Duration;

fn identity() -> ConnIdentity {
    ConnIdentity {
        user: "app".into(),
        default_db: "shop".into(),
    }
}

fn endpoint(session_id: u64, server_id: u32, pools: &Arc<PoolGroup>) -> ServerEndpoint {
    let server = Server::new(
        ServerId(server_id),
        format!("db{server_id}"),
        ServerAddress::parse("127.0.0.1", 3306),
    );
    pools.register_server(Arc::clone(&server));
    ServerEndpoint::new(
        session_id,
        server,
        Arc::clone(pools),
        identity(),
        Duration::from_secs(60),
    )
}

fn query(sql: &str) -> Packet {
    let mut payload = vec![0x03];
    payload.extend_from_slice(sql.as_bytes());
    Packet::from_payload(0, &payload)
}

fn ok_packet(status: u16) -> Packet {
    let mut payload = vec![0x00, 0x00, 0x00];
    payload.extend_from_slice(&status.to_le_bytes());
    payload.extend_from_slice(&[0x00, 0x00]);
    Packet::from_payload(1, &payload)
}

#[test]
fn state_machine_walk() {
    let pools = Arc::new(PoolGroup::new());
    let mut session = Session::new(0, identity(), "10.1.1.1:6000", 0, SessionConfig::default());
    assert_eq!(session.state(), SessionState::Created);

    let ep = endpoint(session.id(), 1, &pools);
    assert!(session.start(&ReadConnRouter, &[], vec![ep]));
    assert_eq!(session.state(), SessionState::Started);

    session.close();
    assert_eq!(session.state(), SessionState::Stopping);
}

#[test]
fn every_kill_reason_delivers_an_err_packet() {
    let reasons = [
        (KillReason::Timeout, err::ER_UNKNOWN_ERROR),
        (KillReason::HandleErrorFailed, err::ER_LOST_CONNECTION),
        (KillReason::RoutingFailed, err::ER_UNKNOWN_ERROR),
        (KillReason::Killed, err::ER_UNKNOWN_ERROR),
        (KillReason::TooManyConnections, err::ER_CON_COUNT_ERROR),
    ];

    for (reason, expected_errno) in reasons {
        let pools = Arc::new(PoolGroup::new());
        let mut session = Session::new(0, identity(), "", 0, SessionConfig::default());
        let ep = endpoint(session.id(), 1, &pools);
        assert!(session.start(&ReadConnRouter, &[], vec![ep]));

        session.kill(reason);
        let output = session.take_client_output();
        assert_eq!(output.len(), 1, "{reason:?} must deliver an ERR packet");

        let parsed = err::parse(&output[0]).expect("an ERR packet");
        assert_eq!(parsed.errno, expected_errno, "{reason:?}");
        assert!(!parsed.sqlstate.is_empty(), "{reason:?} carries a SQLSTATE");
        assert!(!parsed.message.is_empty());
        assert_eq!(session.kill_reason(), reason);
    }
}

// ============================================================================
// Transaction replay
// ============================================================================

/// Minimal replaying router: routes to the first endpoint, buffers the
/// open transaction, and on backend loss consults the replay gate.
struct ReplayRouter {
    policy: ReplayPolicy,
}

struct ReplayingSession {
    endpoints: Vec<ServerEndpoint>,
    active: usize,
    recorder: TrxRecorder,
    policy: ReplayPolicy,
    commit_in_flight: bool,
    client_output: Vec<Packet>,
}

impl Router for ReplayRouter {
    fn make_session(
        &self,
        endpoints: Vec<ServerEndpoint>,
    ) -> Result<Box<dyn RouterSession>, hgate::Error> {
        Ok(Box::new(ReplayingSession {
            endpoints,
            active: 0,
            recorder: TrxRecorder::new(),
            policy: self.policy,
            commit_in_flight: false,
            client_output: Vec::new(),
        }))
    }

    fn name(&self) -> &str {
        "replayrouter"
    }
}

impl RouterSession for ReplayingSession {
    fn route_query(&mut self, packet: Packet) -> bool {
        let sql = String::from_utf8_lossy(&packet.payload()[1..]).to_uppercase();
        self.commit_in_flight = sql.starts_with("COMMIT");
        self.recorder.record(&packet, &self.policy);

        let endpoint = &mut self.endpoints[self.active];
        if !endpoint.is_open() {
            use hgate::pool::ConnectOutcome;
            if !matches!(endpoint.connect(), ConnectOutcome::Connected(_)) {
                return false;
            }
        }
        endpoint.write(&packet).is_ok()
    }

    fn client_reply(&mut self, packet: Packet, _route: &ReplyRoute, reply: &Reply) -> bool {
        use hgate::protocol::constants::SERVER_STATUS_IN_TRX;
        self.recorder.record_response(packet.payload());
        let in_trx = reply
            .server_status()
            .is_some_and(|status| status & SERVER_STATUS_IN_TRX != 0);
        if reply.is_complete() && !in_trx {
            self.recorder.clear();
        }
        self.client_output.push(packet);
        true
    }

    fn handle_error(
        &mut self,
        _error_type: ErrorType,
        _message: &str,
        failing: ServerId,
        _reply: &Reply,
    ) -> bool {
        if self.endpoints[self.active].target() == failing {
            self.endpoints[self.active].close();
        }

        match self.recorder.on_backend_lost(&self.policy, self.commit_in_flight) {
            ReplayDecision::Fail => {
                self.client_output.push(err::create(
                    1,
                    err::ER_LOST_CONNECTION,
                    err::SQLSTATE_COMM_ERROR,
                    "Transaction was interrupted; it cannot be safely replayed",
                ));
                false
            }
            ReplayDecision::Replay => {
                // Re-issue the buffered statements on the next backend.
                self.active += 1;
                let statements: Vec<Packet> = self
                    .recorder
                    .statements()
                    .iter()
                    .map(|stmt| stmt.packet.clone())
                    .collect();
                use hgate::pool::ConnectOutcome;
                let endpoint = &mut self.endpoints[self.active];
                if !matches!(endpoint.connect(), ConnectOutcome::Connected(_)) {
                    return false;
                }
                for statement in &statements {
                    if endpoint.write(statement).is_err() {
                        return false;
                    }
                }
                // The replayed COMMIT succeeded on the new backend.
                self.client_output.push(Packet::from_payload(
                    1,
                    &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00],
                ));
                true
            }
        }
    }

    fn take_client_output(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.client_output)
    }

    fn endpoints_mut(&mut self) -> &mut [ServerEndpoint] {
        &mut self.endpoints
    }
}

fn run_commit_loss(safe_commit: bool) -> (bool, Vec<Packet>) {
    let policy = ReplayPolicy {
        transaction_replay: true,
        transaction_replay_safe_commit: safe_commit,
        max_size: 1024 * 1024,
    };
    let pools = Arc::new(PoolGroup::new());
    let mut session = Session::new(
        0,
        identity(),
        "",
        0,
        SessionConfig {
            replay: policy,
            ..SessionConfig::default()
        },
    );
    let eps = vec![
        endpoint(session.id(), 1, &pools),
        endpoint(session.id(), 2, &pools),
    ];
    assert!(session.start(&ReplayRouter { policy }, &[], eps));

    // BEGIN; INSERT; COMMIT - the backend dies mid-COMMIT.
    assert!(session.route_query(query("BEGIN")));
    assert!(session.client_reply(ok_packet(0x0001), ReplyRoute { source: ServerId(1) }));
    assert!(session.route_query(query("INSERT INTO t VALUES (1)")));
    assert!(session.client_reply(ok_packet(0x0001), ReplyRoute { source: ServerId(1) }));
    assert!(session.route_query(query("COMMIT")));
    session.take_client_output();

    let survived = {
        let router = session.router_session_mut().unwrap();
        router.handle_error(
            ErrorType::Transient,
            "Lost connection to backend server",
            ServerId(1),
            &Reply::new(),
        )
    };
    let router = session.router_session_mut().unwrap();
    let output = router.take_client_output();
    (survived, output)
}

#[test]
fn safe_commit_fails_the_transaction_to_the_client() {
    let (survived, output) = run_commit_loss(true);
    assert!(!survived, "the session does not survive a lost COMMIT");
    assert_eq!(output.len(), 1);
    assert_eq!(output[0].classify(false), ReplyKind::Err);
    let parsed = err::parse(&output[0]).unwrap();
    assert_eq!(parsed.sqlstate, "08S01");
}

#[test]
fn unsafe_commit_replays_and_answers_ok() {
    let (survived, output) = run_commit_loss(false);
    assert!(survived, "the transaction was replayed");
    assert_eq!(output.len(), 1);
    assert_eq!(
        output[0].classify(false),
        ReplyKind::Ok,
        "the client sees the replayed COMMIT succeed"
    );
}

#[test]
fn replay_divergence_is_detectable() {
    let policy = ReplayPolicy {
        transaction_replay: true,
        transaction_replay_safe_commit: true,
        max_size: 1024,
    };
    let mut recorder = TrxRecorder::new();
    recorder.record(&query("BEGIN"), &policy);
    recorder.record_response(&[0x00, 0x00, 0x00, 0x02, 0x00]);
    recorder.record(&query("SELECT balance FROM acct"), &policy);
    recorder.record_response(&[0x01, 0x42]);

    // The replayed SELECT answers differently on the new backend.
    assert!(recorder.verify_replayed_response(1, &[0x01, 0x42]));
    assert!(!recorder.verify_replayed_response(1, &[0x01, 0x43]));
}
