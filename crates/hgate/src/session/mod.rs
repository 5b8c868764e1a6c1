// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client session.
//!
//! A session ties one client connection to zero or more backend
//! connections. It owns the protocol state, the filter/router pipeline,
//! the session-command history replayed across reconnects, and the
//! response aggregation that turns raw backend packets into completed
//! replies. Sessions exist only on the worker that created them; moving
//! one is a distinct migration operation performed by that worker.

pub mod history;
pub mod protocol_data;
pub mod replay;
pub mod variables;

pub use history::{HistoryEntry, SessionHistory};
pub use protocol_data::{MariaDbData, ProtocolData};
pub use replay::{ReplayDecision, ReplayPolicy, TrxRecorder};
pub use variables::{SessionVariables, VariableHandler};

use crate::pool::ConnIdentity;
use crate::protocol::constants::{
    Command, SERVER_STATUS_IN_TRX,
};
use crate::protocol::{self, err, Packet, ReplyKind, SignalState};
use crate::routing::{
    Filter, FilterContext, FilterSession, Reply, ReplyOutcome, ReplyRoute, Router, RouterSession,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-global session id allocator; ids are unique for the process
/// lifetime and monotonically increasing.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Highest session id handed out so far.
pub fn session_max_id() -> u64 {
    NEXT_SESSION_ID.load(Ordering::Relaxed).saturating_sub(1)
}

fn allocate_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Session lifecycle.
///
/// ```text
/// CREATED --start--> STARTED --close/kill--> STOPPING --last-ref--> FREE
///    |
///    +--auth-failed--> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Stopping,
    Failed,
    Free,
}

/// Why a session was killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KillReason {
    #[default]
    None,
    Timeout,
    HandleErrorFailed,
    RoutingFailed,
    Killed,
    TooManyConnections,
}

impl KillReason {
    /// Client-facing message and error number for the final ERR packet.
    fn to_err(self) -> (u16, &'static str, &'static str) {
        match self {
            KillReason::None | KillReason::Killed => {
                (err::ER_UNKNOWN_ERROR, err::SQLSTATE_GENERAL, "Session killed")
            }
            KillReason::Timeout => (
                err::ER_UNKNOWN_ERROR,
                err::SQLSTATE_GENERAL,
                "Connection killed by the proxy: timed out by server",
            ),
            KillReason::HandleErrorFailed => (
                err::ER_LOST_CONNECTION,
                err::SQLSTATE_COMM_ERROR,
                "Lost connection to backend server",
            ),
            KillReason::RoutingFailed => (
                err::ER_UNKNOWN_ERROR,
                err::SQLSTATE_COMM_ERROR,
                "Routing the query failed",
            ),
            KillReason::TooManyConnections => (
                err::ER_CON_COUNT_ERROR,
                err::SQLSTATE_GENERAL,
                "Too many connections",
            ),
        }
    }
}

/// When the retained-statement ring is dumped to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpStatements {
    #[default]
    Never,
    OnError,
    OnClose,
}

/// Session tuning, typically shared by all sessions of a service.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Kill the session after this much client idle time; zero disables.
    pub conn_idle_timeout: Duration,
    /// How long an endpoint may wait for a pooled connection slot.
    pub multiplex_timeout: Duration,
    /// Size of the retained-statement ring; zero disables retention.
    pub retain_last_statements: usize,
    pub dump_statements: DumpStatements,
    /// Bound of the session-command history.
    pub max_sescmd_history: usize,
    /// Keep routing with a pruned history instead of failing reconnects.
    pub prune_sescmd_history: bool,
    pub replay: ReplayPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            conn_idle_timeout: Duration::ZERO,
            multiplex_timeout: Duration::from_secs(60),
            retain_last_statements: 0,
            dump_statements: DumpStatements::Never,
            max_sescmd_history: 50,
            prune_sescmd_history: false,
            replay: ReplayPolicy::default(),
        }
    }
}

/// Aggregation state of the reply currently streaming to the client.
#[derive(Debug, Default)]
struct ReplyTracker {
    reply: Reply,
    signal_state: SignalState,
    boundaries: u32,
    /// A request expecting a response has been routed and the response
    /// has not completed.
    expecting: bool,
}

/// Notified when the session's user data changes; visited only on the
/// owning worker.
pub type UserDataObserver = Box<dyn FnMut() + Send>;

/// One client session.
pub struct Session {
    id: u64,
    worker_index: usize,
    identity: ConnIdentity,
    remote: String,

    state: SessionState,
    refcount: u32,
    kill_reason: KillReason,

    protocol: ProtocolData,
    config: SessionConfig,

    filters: Vec<Box<dyn FilterSession>>,
    router: Option<Box<dyn RouterSession>>,

    /// Packets staged for the client socket.
    client_output: Vec<Packet>,
    tracker: ReplyTracker,

    history: SessionHistory,
    variables: SessionVariables,
    trx_recorder: TrxRecorder,

    retained: VecDeque<String>,
    delayed: Vec<(Instant, Packet)>,
    log_ring: VecDeque<String>,
    observers: Vec<UserDataObserver>,

    idle_since: Instant,
}

impl Session {
    pub fn new(
        worker_index: usize,
        identity: ConnIdentity,
        remote: impl Into<String>,
        client_caps: u64,
        config: SessionConfig,
    ) -> Self {
        let history = SessionHistory::new(config.max_sescmd_history);
        Self {
            id: allocate_session_id(),
            worker_index,
            identity,
            remote: remote.into(),
            state: SessionState::Created,
            refcount: 1,
            kill_reason: KillReason::None,
            protocol: ProtocolData::maria_db(client_caps),
            config,
            filters: Vec::new(),
            router: None,
            client_output: Vec::new(),
            tracker: ReplyTracker::default(),
            history,
            variables: SessionVariables::new(),
            trx_recorder: TrxRecorder::new(),
            retained: VecDeque::new(),
            delayed: Vec::new(),
            log_ring: VecDeque::new(),
            observers: Vec::new(),
            idle_since: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    /// Adjust ownership when the session migrates to another worker.
    pub(crate) fn set_worker_index(&mut self, index: usize) {
        self.worker_index = index;
    }

    pub fn identity(&self) -> &ConnIdentity {
        &self.identity
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn kill_reason(&self) -> KillReason {
        self.kill_reason
    }

    pub fn protocol(&self) -> &ProtocolData {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut ProtocolData {
        &mut self.protocol
    }

    pub fn variables_mut(&mut self) -> &mut SessionVariables {
        &mut self.variables
    }

    pub fn history(&self) -> &SessionHistory {
        &self.history
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn multiplex_timeout(&self) -> Duration {
        self.config.multiplex_timeout
    }

    pub fn router_session_mut(&mut self) -> Option<&mut dyn RouterSession> {
        match self.router.as_mut() {
            Some(router) => Some(router.as_mut()),
            None => None,
        }
    }

    // ------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------

    pub fn retain(&mut self) {
        self.refcount += 1;
    }

    /// Drop one reference; returns `true` when this was the last one and
    /// the memory may be reclaimed once pending I/O has settled.
    pub fn release(&mut self) -> bool {
        debug_assert!(self.refcount > 0);
        self.refcount -= 1;
        self.refcount == 0
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create the router and filter sessions; allowed only in `CREATED`.
    pub fn start(
        &mut self,
        router: &dyn Router,
        filters: &[&dyn Filter],
        endpoints: Vec<crate::pool::ServerEndpoint>,
    ) -> bool {
        if self.state != SessionState::Created {
            return false;
        }

        let router_session = match router.make_session(endpoints) {
            Ok(session) => session,
            Err(error) => {
                log::error!("[SESSION] {}: creating router session failed: {error}", self.id);
                self.state = SessionState::Failed;
                return false;
            }
        };

        let mut filter_sessions = Vec::with_capacity(filters.len());
        for filter in filters {
            match filter.make_session() {
                Ok(session) => filter_sessions.push(session),
                Err(error) => {
                    log::error!(
                        "[SESSION] {}: creating filter session for '{}' failed: {error}",
                        self.id,
                        filter.name()
                    );
                    self.state = SessionState::Failed;
                    return false;
                }
            }
        }

        self.router = Some(router_session);
        self.filters = filter_sessions;
        self.state = SessionState::Started;
        true
    }

    /// Authentication failed before the session was started.
    pub fn fail_auth(&mut self) {
        if self.state == SessionState::Created {
            self.state = SessionState::Failed;
        }
    }

    /// Idempotent orderly close; transitions to `STOPPING`.
    pub fn close(&mut self) {
        if matches!(self.state, SessionState::Stopping | SessionState::Free) {
            return;
        }
        if self.config.dump_statements == DumpStatements::OnClose {
            self.dump_statements();
        }
        self.state = SessionState::Stopping;
    }

    /// Abrupt close: stage an ERR packet for the client, record the
    /// reason, transition to `STOPPING`.
    pub fn kill(&mut self, reason: KillReason) {
        if matches!(self.state, SessionState::Stopping | SessionState::Free) {
            return;
        }
        self.kill_reason = reason;
        let (errno, sqlstate, message) = reason.to_err();
        self.client_output
            .push(err::create(1, errno, sqlstate, message));
        log::info!("[SESSION] {}: killed ({reason:?})", self.id);
        if self.config.dump_statements == DumpStatements::OnError {
            self.dump_statements();
        }
        self.state = SessionState::Stopping;
    }

    /// The last reference is gone and pending I/O has settled.
    pub(crate) fn finalize(&mut self) {
        self.state = SessionState::Free;
    }

    // ------------------------------------------------------------------
    // Downstream pipeline
    // ------------------------------------------------------------------

    /// Route one client packet: protocol tracking, filters, router.
    /// Returning `false` is fatal; the session has already recorded its
    /// kill reason.
    pub fn route_query(&mut self, mut packet: Packet) -> bool {
        if self.state != SessionState::Started {
            return false;
        }
        self.idle_since = Instant::now();

        let infile_active = self.protocol.is_local_infile_active();
        self.protocol.track_query(&packet);

        if !infile_active {
            if let Ok(Command::Query) = packet.command() {
                let sql = String::from_utf8_lossy(&packet.payload()[1..]).into_owned();
                self.retain_statement(&sql);

                // Proxy-scoped variables are answered locally.
                if let Some(response) = self.intercept_variable_set(&sql) {
                    self.client_output.push(response);
                    return true;
                }

                if is_session_command(&sql) {
                    self.history.add(packet.clone());
                    if !self.history.is_complete() && !self.config.prune_sescmd_history {
                        self.protocol.set_history_recoverable(false);
                    }
                }
            }

            if self.protocol.is_trx_active() {
                let recorder_policy = self.config.replay;
                self.trx_recorder.record(&packet, &recorder_policy);
            }

            if self.protocol.will_respond(&packet) {
                self.tracker.expecting = true;
            }
        }

        // Filter chain, downstream order. A filter may short-circuit.
        let mut ctx = FilterContext::new();
        for index in 0..self.filters.len() {
            if !self.filters[index].route_query(&mut ctx, &mut packet) {
                self.kill(KillReason::RoutingFailed);
                return false;
            }
            if let Some(response) = ctx.take_response() {
                self.tracker.expecting = false;
                self.client_output.push(response);
                return true;
            }
        }

        let routed = match self.router.as_mut() {
            Some(router) => router.route_query(packet),
            None => false,
        };
        if !routed {
            self.kill(KillReason::RoutingFailed);
            return false;
        }
        self.drain_router_output();
        true
    }

    /// Re-enqueue a packet for delayed dispatch from the same worker;
    /// used by rate limiting and transient-failure paths.
    pub fn delay_routing(&mut self, packet: Packet, delay: Duration) {
        self.delayed.push((Instant::now() + delay, packet));
    }

    // ------------------------------------------------------------------
    // Upstream pipeline
    // ------------------------------------------------------------------

    /// Process one backend reply packet: aggregate reply state, consult
    /// the router, pass filters in reverse, stage for the client.
    /// Returning `false` is fatal for the session.
    pub fn client_reply(&mut self, packet: Packet, route: ReplyRoute) -> bool {
        if self.state != SessionState::Started {
            return false;
        }

        self.update_reply_state(&packet);

        let reply_snapshot = self.tracker.reply.clone();
        let ok = match self.router.as_mut() {
            Some(router) => router.client_reply(packet, &route, &reply_snapshot),
            None => false,
        };
        if !ok {
            self.kill(KillReason::HandleErrorFailed);
            return false;
        }

        let forwarded = match self.router.as_mut() {
            Some(router) => router.take_client_output(),
            None => Vec::new(),
        };
        for mut packet in forwarded {
            let mut ctx = FilterContext::new();
            for index in (0..self.filters.len()).rev() {
                if !self.filters[index].client_reply(&mut ctx, &mut packet, &route, &reply_snapshot)
                {
                    self.kill(KillReason::HandleErrorFailed);
                    return false;
                }
            }
            self.client_output.push(packet);
        }

        if self.tracker.reply.is_complete() {
            self.tracker.expecting = false;
        }
        true
    }

    fn update_reply_state(&mut self, packet: &Packet) {
        let tracker = &mut self.tracker;
        if tracker.reply.is_complete() {
            tracker.reply.next_result_set();
            tracker.boundaries = 0;
            tracker.signal_state = SignalState::default();
        }

        tracker.reply.record_checksum(packet.payload());
        if self.protocol.is_trx_active() && self.trx_recorder.response_pending() {
            self.trx_recorder.record_response(packet.payload());
        }

        match packet.classify(false) {
            ReplyKind::Ok => {
                if let Ok(ok) = protocol::OkPacket::parse(packet.payload()) {
                    tracker.reply.set_server_status(ok.status);
                    self.protocol.track_reply_status(ok.status);
                    if ok.status & SERVER_STATUS_IN_TRX == 0 && !self.protocol.is_trx_active() {
                        self.trx_recorder.clear();
                    }
                }
            }
            ReplyKind::Err => {
                if let Ok(parsed) = err::parse(packet) {
                    tracker.reply.set_outcome(ReplyOutcome::Error(parsed));
                }
            }
            ReplyKind::LocalInfile => {
                self.protocol.begin_local_infile();
            }
            ReplyKind::Eof | ReplyKind::Data => {
                if tracker.reply.outcome().is_none() {
                    tracker.reply.set_outcome(ReplyOutcome::ResultSet);
                }
            }
            ReplyKind::AuthSwitch | ReplyKind::Unknown => {}
        }

        let count = protocol::count_signal_packets(
            packet.as_wire(),
            tracker.boundaries,
            &mut tracker.signal_state,
        );
        tracker.boundaries = count.total;

        let complete = if count.aborted {
            true
        } else {
            count.total % 2 == 0 && count.total > 0 && !count.more
        };
        let ok_complete = matches!(packet.classify(false), ReplyKind::Ok)
            && count.total == 0
            && !count.more;
        if complete || ok_complete {
            if tracker.reply.outcome().is_none() {
                tracker.reply.set_outcome(ReplyOutcome::Ok);
            }
            tracker.reply.set_complete();
        }
    }

    /// The completed-reply metadata of the current stream.
    pub fn reply(&self) -> &Reply {
        &self.tracker.reply
    }

    /// A routed request is still waiting for its response.
    pub fn response_pending(&self) -> bool {
        self.tracker.expecting
    }

    fn drain_router_output(&mut self) {
        let forwarded = match self.router.as_mut() {
            Some(router) => router.take_client_output(),
            None => return,
        };
        self.client_output.extend(forwarded);
    }

    /// Take the packets staged for the client socket.
    pub fn take_client_output(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.client_output)
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    /// Invoked by the owning worker once per decisecond with the current
    /// idle time. Dispatches due delayed packets and enforces the idle
    /// timeout.
    pub fn tick(&mut self) {
        let now = Instant::now();

        if !self.delayed.is_empty() {
            let mut due = Vec::new();
            self.delayed.retain(|(at, packet)| {
                if *at <= now {
                    due.push(packet.clone());
                    false
                } else {
                    true
                }
            });
            for packet in due {
                if !self.route_query(packet) {
                    return;
                }
            }
        }

        let idle_timeout = self.config.conn_idle_timeout;
        if !idle_timeout.is_zero()
            && self.state == SessionState::Started
            && !self.tracker.expecting
            && now.duration_since(self.idle_since) > idle_timeout
        {
            self.kill(KillReason::Timeout);
        }
    }

    pub fn idle(&self) -> Duration {
        self.idle_since.elapsed()
    }

    // ------------------------------------------------------------------
    // Pooling, migration
    // ------------------------------------------------------------------

    /// Idle backends of this session may be parked in the worker pool.
    pub fn can_pool_backends(&self) -> bool {
        self.state == SessionState::Started
            && !self.protocol.is_trx_active()
            && !self.tracker.expecting
            && !self.protocol.is_local_infile_active()
    }

    /// The session may be moved to another worker: not mid-transaction
    /// and not holding non-replayable in-flight state.
    pub fn is_movable(&self) -> bool {
        !self.protocol.is_trx_active()
            && !self.protocol.is_local_infile_active()
            && !self.tracker.expecting
            && self.delayed.is_empty()
    }

    // ------------------------------------------------------------------
    // Statement retention and session log
    // ------------------------------------------------------------------

    /// Keep the last N statements for post-mortem logging.
    pub fn retain_statement(&mut self, sql: &str) {
        if self.config.retain_last_statements == 0 {
            return;
        }
        if self.retained.len() == self.config.retain_last_statements {
            self.retained.pop_front();
        }
        self.retained.push_back(sql.to_string());
    }

    /// Write the retained statements to the log, oldest first.
    pub fn dump_statements(&self) {
        for (index, sql) in self.retained.iter().enumerate() {
            log::info!("[SESSION] {}: stmt {}: {}", self.id, index, sql);
        }
    }

    pub fn retained_statements(&self) -> impl Iterator<Item = &str> {
        self.retained.iter().map(String::as_str)
    }

    /// Append to the bounded per-session log buffer.
    pub fn log(&mut self, message: impl Into<String>) {
        const SESSION_LOG_CAP: usize = 50;
        if self.log_ring.len() == SESSION_LOG_CAP {
            self.log_ring.pop_front();
        }
        self.log_ring.push_back(message.into());
    }

    pub fn log_entries(&self) -> impl Iterator<Item = &str> {
        self.log_ring.iter().map(String::as_str)
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Register an observer for user-data changes. Observers run on the
    /// owning worker only.
    pub fn add_userdata_observer(&mut self, observer: UserDataObserver) {
        self.observers.push(observer);
    }

    pub fn notify_userdata_changed(&mut self) {
        for observer in &mut self.observers {
            observer();
        }
    }

    // ------------------------------------------------------------------
    // Memory accounting
    // ------------------------------------------------------------------

    /// Fixed per-session bytes.
    pub fn static_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }

    /// Heap bytes owned by this session.
    pub fn varying_size(&self) -> usize {
        let retained: usize = self.retained.iter().map(String::len).sum();
        let log: usize = self.log_ring.iter().map(String::len).sum();
        let output: usize = self.client_output.iter().map(|p| p.as_wire().len()).sum();
        let delayed: usize = self.delayed.iter().map(|(_, p)| p.as_wire().len()).sum();
        self.history.varying_size() + self.trx_recorder.size() + retained + log + output + delayed
    }

    // ------------------------------------------------------------------
    // Proxy-scoped variables
    // ------------------------------------------------------------------

    /// Intercept `SET @maxscale.<scope>.<name> = <value>`; returns the
    /// client response when the statement was handled locally.
    fn intercept_variable_set(&mut self, sql: &str) -> Option<Packet> {
        let (name, value) = parse_maxscale_set(sql)?;
        match self.variables.set_variable_value(&name, &value) {
            None => Some(Packet::from_payload(
                1,
                &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00],
            )),
            Some(error) => Some(err::create(
                1,
                err::ER_UNKNOWN_ERROR,
                err::SQLSTATE_GENERAL,
                &error,
            )),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("worker", &self.worker_index)
            .field("state", &self.state)
            .field("user", &self.identity.user)
            .field("remote", &self.remote)
            .finish()
    }
}

/// Statements that alter session state and belong in the history.
fn is_session_command(sql: &str) -> bool {
    let sql = sql.trim_start();
    ["USE ", "SET ", "PREPARE ", "SET NAMES"]
        .iter()
        .any(|prefix| {
            sql.len() >= prefix.len() && sql[..prefix.len()].eq_ignore_ascii_case(prefix)
        })
}

/// Parse `SET @maxscale.<scope>.<name> = <value>`.
fn parse_maxscale_set(sql: &str) -> Option<(String, String)> {
    let sql = sql.trim();
    if sql.len() < 4 || !sql[..4].eq_ignore_ascii_case("SET ") {
        return None;
    }
    let rest = sql[4..].trim_start();
    if !rest.to_ascii_lowercase().starts_with("@maxscale.") {
        return None;
    }
    let eq = rest.find('=')?;
    let name = rest[..eq].trim().to_string();
    let value = rest[eq + 1..].trim().trim_matches('\'').to_string();
    Some((name, value))
}
