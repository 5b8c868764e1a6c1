// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Routing worker: one thread, one poll instance, one set of sessions.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                      RoutingWorker                           |
//! |  +-------------------------------------------------------+  |
//! |  |                     mio::Poll                          |  |
//! |  |  - client sockets (edge-triggered)                     |  |
//! |  |  - backend sockets                                     |  |
//! |  |  - waker (cross-worker task queue)                     |  |
//! |  +-------------------------------------------------------+  |
//! |                             |                                |
//! |                             v                                |
//! |   dispatch -> tick: timeouts | zombies | sweeps | rebalance  |
//! +-------------------------------------------------------------+
//! ```
//!
//! Execution on a worker is single-threaded and cooperative: event
//! handlers, timers and cross-worker tasks run to completion, never
//! interleaved. Other threads mutate a worker's sessions only by posting
//! a task onto its queue.

use super::rebalance::AverageN;
use super::storage::IndexedStorage;
use super::watchdog::WatchdogNotifier;
use crate::pool::PoolGroup;
use crate::protocol::Packet;
use crate::routing::ReplyRoute;
use crate::session::{KillReason, Session, SessionState};
use crossbeam::queue::SegQueue;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Token reserved for the cross-worker task queue waker.
const WAKER_TOKEN: Token = Token(0);

/// First token handed to sockets.
const SOCKET_TOKEN_START: usize = 2;

/// Maximum events processed per poll.
const MAX_EVENTS: usize = 256;

/// Poll timeout; the tick work runs at least this often.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Grace period before a stopping session's backends are closed by force.
const ZOMBIE_GRACE: Duration = Duration::from_secs(2);

thread_local! {
    static CURRENT_WORKER: std::cell::Cell<Option<usize>> =
        const { std::cell::Cell::new(None) };
}

/// Index of the routing worker the calling thread belongs to, if any.
pub fn current_worker_index() -> Option<usize> {
    CURRENT_WORKER.with(|cell| cell.get())
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Listening and routing.
    Active = 0,
    /// Routing, no longer listening.
    Draining = 1,
    /// Neither; waiting for removal.
    Inactive = 2,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Active,
            1 => WorkerState::Draining,
            _ => WorkerState::Inactive,
        }
    }
}

/// Per-worker statistics for the admin surface.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub errors: AtomicU64,
    pub hangups: AtomicU64,
    pub accepts: AtomicU64,
}

/// A unit of work posted onto a worker's loop.
pub type WorkerTask = Box<dyn FnOnce(&mut RoutingWorker) + Send>;

/// Cross-thread face of one routing worker.
///
/// The handle is the only way other threads interact with a worker:
/// queued or semaphored calls, statistics reads, and pool statistics via
/// the shared [`PoolGroup`].
pub struct WorkerHandle {
    index: usize,
    state: AtomicU8,
    listening: AtomicBool,
    shutdown_requested: AtomicBool,

    session_count: AtomicUsize,
    /// One-second load percentage, written by the worker.
    load_percent: AtomicU32,
    avg_load: Mutex<AverageN>,

    pools: Arc<PoolGroup>,
    stats: WorkerStats,
    notifier: Arc<WatchdogNotifier>,

    tasks: SegQueue<WorkerTask>,
    waker: Mutex<Option<Waker>>,

    /// Shared count of workers ever created; the denominator of the
    /// per-worker pool capacity share.
    n_created: Arc<AtomicUsize>,
}

impl WorkerHandle {
    fn new(index: usize, rebalance_window: usize, n_created: Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            index,
            state: AtomicU8::new(WorkerState::Active as u8),
            listening: AtomicBool::new(true),
            shutdown_requested: AtomicBool::new(false),
            session_count: AtomicUsize::new(0),
            load_percent: AtomicU32::new(0),
            avg_load: Mutex::new(AverageN::new(rebalance_window)),
            pools: Arc::new(PoolGroup::new()),
            stats: WorkerStats::default(),
            notifier: WatchdogNotifier::new(),
            tasks: SegQueue::new(),
            waker: Mutex::new(None),
            n_created,
        })
    }

    /// Count of workers ever created in this worker's set.
    pub fn n_created(&self) -> usize {
        self.n_created.load(Ordering::Acquire).max(1)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == WorkerState::Active
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub(super) fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(super) fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::Release);
    }

    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Acquire)
    }

    /// One-second load percentage.
    pub fn load(&self) -> u32 {
        self.load_percent.load(Ordering::Relaxed)
    }

    /// Rolling average load over the rebalance window.
    pub fn average_load(&self) -> u32 {
        self.avg_load.lock().value()
    }

    pub(super) fn sample_load(&self) {
        let load = self.load();
        self.avg_load.lock().add_value(load);
    }

    pub fn pools(&self) -> &Arc<PoolGroup> {
        &self.pools
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn notifier(&self) -> &Arc<WatchdogNotifier> {
        &self.notifier
    }

    /// Fire-and-forget: run `task` on the worker's own loop.
    pub fn execute_queued(&self, task: WorkerTask) -> bool {
        self.tasks.push(task);
        self.wake();
        true
    }

    /// Run `task` on the worker's loop and wait for its result. Must not
    /// be called from the worker's own thread.
    pub fn execute_semaphored<R, F>(&self, task: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut RoutingWorker) -> R + Send + 'static,
    {
        debug_assert_ne!(
            current_worker_index(),
            Some(self.index),
            "semaphored call from the worker's own thread would deadlock"
        );
        let (tx, rx) = mpsc::channel();
        self.execute_queued(Box::new(move |worker| {
            let _ = tx.send(task(worker));
        }));
        rx.recv().ok()
    }

    /// Ask the worker to begin shutdown on its own loop.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
        self.wake();
    }

    pub(super) fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.lock().as_ref() {
            let _ = waker.wake();
        }
    }
}

/// A session whose close is underway; its backends get a grace period to
/// settle before they are closed by force.
#[derive(Debug)]
struct Zombie {
    session_id: u64,
    since: Instant,
}

/// Client socket state of one session.
struct ClientSocket {
    stream: TcpStream,
    token: Token,
    decoder: crate::protocol::FrameDecoder,
    out_buf: Vec<u8>,
}

struct SessionEntry {
    session: Session,
    client: Option<ClientSocket>,
}

/// Periodic per-tick work, at the cadence the original runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickTask {
    /// Evict expired pooled connections (1 s).
    PoolSweep,
    /// Wake endpoints waiting for connection slots (5 s).
    ActivateWaiting,
    /// Fail endpoints past their multiplex timeout (10 s).
    FailTimedOut,
}

struct ScheduledTick {
    task: TickTask,
    every: Duration,
    next: Instant,
}

/// Deferred call on the worker's timer queue. Returning `false`
/// deregisters the call.
pub type DeferredCall = Box<dyn FnMut(&mut RoutingWorker) -> bool + Send>;

struct DCall {
    next: Instant,
    every: Duration,
    func: Option<DeferredCall>,
}

/// A rebalance noted by the dispatcher; performed from the tick, never
/// from the message handler, so a poll round never observes a session it
/// has just given away.
struct PendingRebalance {
    to: Arc<WorkerHandle>,
    n_sessions: usize,
}

/// One routing worker: event loop, sessions, pools, timers.
pub struct RoutingWorker {
    handle: Arc<WorkerHandle>,
    poll: Poll,

    sessions: HashMap<u64, SessionEntry>,
    /// Socket token to (session id, backend conn id or 0 for the client
    /// side).
    token_map: HashMap<Token, (u64, u64)>,
    next_token: usize,

    zombies: Vec<Zombie>,
    dcalls: Vec<DCall>,
    ticks: Vec<ScheduledTick>,
    pending_rebalance: Option<PendingRebalance>,

    storage: IndexedStorage,
    last_timeout_check: Instant,
    running: bool,
}

impl RoutingWorker {
    /// Create a standalone worker and its handle. Workers belonging to a
    /// [`super::Workers`] set share its created-count; standalone workers
    /// count themselves.
    pub fn create(index: usize, rebalance_window: usize) -> io::Result<(Self, Arc<WorkerHandle>)> {
        Self::create_in_set(index, rebalance_window, Arc::new(AtomicUsize::new(1)))
    }

    pub(super) fn create_in_set(
        index: usize,
        rebalance_window: usize,
        n_created: Arc<AtomicUsize>,
    ) -> io::Result<(Self, Arc<WorkerHandle>)> {
        let handle = WorkerHandle::new(index, rebalance_window, n_created);
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        *handle.waker.lock() = Some(waker);

        let now = Instant::now();
        let worker = Self {
            handle: Arc::clone(&handle),
            poll,
            sessions: HashMap::new(),
            token_map: HashMap::new(),
            next_token: SOCKET_TOKEN_START,
            zombies: Vec::new(),
            dcalls: Vec::new(),
            ticks: vec![
                ScheduledTick {
                    task: TickTask::PoolSweep,
                    every: Duration::from_secs(1),
                    next: now,
                },
                ScheduledTick {
                    task: TickTask::ActivateWaiting,
                    every: Duration::from_secs(5),
                    next: now,
                },
                ScheduledTick {
                    task: TickTask::FailTimedOut,
                    every: Duration::from_secs(10),
                    next: now,
                },
            ],
            pending_rebalance: None,
            storage: IndexedStorage::new(),
            last_timeout_check: now,
            running: false,
        };
        Ok((worker, handle))
    }

    pub fn handle(&self) -> &Arc<WorkerHandle> {
        &self.handle
    }

    pub fn index(&self) -> usize {
        self.handle.index
    }

    pub fn storage_mut(&mut self) -> &mut IndexedStorage {
        &mut self.storage
    }

    pub fn session_ids(&self) -> Vec<u64> {
        self.sessions.keys().copied().collect()
    }

    pub fn session(&self, id: u64) -> Option<&Session> {
        self.sessions.get(&id).map(|entry| &entry.session)
    }

    pub fn session_mut(&mut self, id: u64) -> Option<&mut Session> {
        self.sessions.get_mut(&id).map(|entry| &mut entry.session)
    }

    // ------------------------------------------------------------------
    // Session management
    // ------------------------------------------------------------------

    /// Adopt a session without a client socket (tests, local clients,
    /// migration of socketless sessions).
    pub fn add_session(&mut self, mut session: Session) -> u64 {
        session.set_worker_index(self.handle.index);
        let id = session.id();
        self.sessions.insert(
            id,
            SessionEntry {
                session,
                client: None,
            },
        );
        self.handle
            .session_count
            .store(self.sessions.len(), Ordering::Release);
        id
    }

    /// Adopt a session together with its accepted client socket.
    pub fn attach_client(&mut self, session: Session, mut stream: TcpStream) -> io::Result<u64> {
        let token = self.allocate_token();
        self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.handle.stats.accepts.fetch_add(1, Ordering::Relaxed);

        let id = self.add_session(session);
        self.token_map.insert(token, (id, 0));
        if let Some(entry) = self.sessions.get_mut(&id) {
            entry.client = Some(ClientSocket {
                stream,
                token,
                decoder: crate::protocol::FrameDecoder::new(),
                out_buf: Vec::new(),
            });
        }
        Ok(id)
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Orderly close: the session transitions to `STOPPING` and joins the
    /// zombie list for finalization.
    pub fn close_session(&mut self, id: u64) {
        if let Some(entry) = self.sessions.get_mut(&id) {
            entry.session.close();
            self.zombies.push(Zombie {
                session_id: id,
                since: Instant::now(),
            });
        }
    }

    /// Abrupt close with a reason; the ERR packet is flushed to the
    /// client before the socket goes.
    pub fn kill_session(&mut self, id: u64, reason: KillReason) {
        if let Some(entry) = self.sessions.get_mut(&id) {
            entry.session.kill(reason);
            Self::flush_client(&self.handle, entry);
            self.zombies.push(Zombie {
                session_id: id,
                since: Instant::now(),
            });
        }
    }

    /// Route a packet on behalf of a session, then flush I/O.
    pub fn route_query(&mut self, id: u64, packet: Packet) -> bool {
        let Some(entry) = self.sessions.get_mut(&id) else {
            return false;
        };
        let ok = entry.session.route_query(packet);
        Self::flush_session_io(&self.handle, entry);
        if !ok {
            self.close_session(id);
        }
        ok
    }

    /// Deliver a backend packet on behalf of a session, then flush I/O.
    pub fn deliver_reply(&mut self, id: u64, packet: Packet, route: ReplyRoute) -> bool {
        let Some(entry) = self.sessions.get_mut(&id) else {
            return false;
        };
        let ok = entry.session.client_reply(packet, route);
        Self::flush_session_io(&self.handle, entry);
        if !ok {
            self.close_session(id);
        }
        ok
    }

    /// Move a movable session to another worker. Runs on this worker's
    /// loop; the session and its client socket are re-registered on the
    /// target from a queued task.
    pub fn move_session_to(&mut self, id: u64, target: &Arc<WorkerHandle>) -> bool {
        let Some(entry) = self.sessions.get_mut(&id) else {
            return false;
        };
        if !entry.session.is_movable() {
            return false;
        }

        let mut entry = self.sessions.remove(&id).expect("checked above");
        self.handle
            .session_count
            .store(self.sessions.len(), Ordering::Release);

        let client = match entry.client.take() {
            Some(mut client) => {
                self.token_map.remove(&client.token);
                let _ = self.poll.registry().deregister(&mut client.stream);
                Some(client)
            }
            None => None,
        };

        let session = entry.session;
        target.execute_queued(Box::new(move |worker| {
            let id = worker.add_session(session);
            if let Some(client) = client {
                let token = worker.allocate_token();
                let mut stream = client.stream;
                if worker
                    .poll
                    .registry()
                    .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
                    .is_ok()
                {
                    worker.token_map.insert(token, (id, 0));
                    if let Some(entry) = worker.sessions.get_mut(&id) {
                        entry.client = Some(ClientSocket {
                            stream,
                            token,
                            decoder: client.decoder,
                            out_buf: client.out_buf,
                        });
                    }
                } else {
                    log::error!("[WORKER] re-registering migrated client failed; closing");
                    worker.close_session(id);
                }
            }
            log::debug!("[WORKER] adopted session {id}");
        }));
        true
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Run until shutdown completes. The worker thread never exits before
    /// process shutdown; deactivated workers keep polling their queue.
    pub fn run(&mut self) {
        CURRENT_WORKER.with(|cell| cell.set(Some(self.handle.index)));
        self.running = true;
        let mut events = Events::with_capacity(MAX_EVENTS);

        let mut busy = Duration::ZERO;
        let mut window_start = Instant::now();

        while self.running {
            if let Err(error) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if error.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[WORKER] {}: poll failed: {error}", self.handle.index);
                break;
            }
            let woke = Instant::now();

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    token => self.dispatch_socket_event(
                        token,
                        event.is_readable(),
                        event.is_writable(),
                        event.is_error() || event.is_read_closed() || event.is_write_closed(),
                    ),
                }
            }
            self.drain_tasks();
            self.epoll_tick();
            self.handle.notifier.notify();

            // One-second load: share of wall time not spent waiting in
            // the poll call.
            busy += woke.elapsed();
            let window = window_start.elapsed();
            if window >= Duration::from_secs(1) {
                let percent =
                    (busy.as_secs_f64() / window.as_secs_f64() * 100.0).min(100.0) as u32;
                self.handle.load_percent.store(percent, Ordering::Relaxed);
                busy = Duration::ZERO;
                window_start = Instant::now();
            }

            if self.handle.shutdown_requested() {
                self.try_shutdown();
            }
        }

        CURRENT_WORKER.with(|cell| cell.set(None));
    }

    fn drain_tasks(&mut self) {
        while let Some(task) = self.handle.tasks.pop() {
            task(self);
        }
    }

    /// One iteration of the loop's housekeeping, in the order the
    /// original runs it.
    pub fn epoll_tick(&mut self) {
        self.process_timeouts();
        self.delete_zombies();
        self.run_tick_tasks();
        self.run_dcalls();

        if self.pending_rebalance.is_some() {
            self.perform_rebalance();
        }

        self.maybe_deactivate();
    }

    /// Once per decisecond, give every session its idle tick.
    fn process_timeouts(&mut self) {
        if self.last_timeout_check.elapsed() < Duration::from_millis(100) {
            return;
        }
        self.last_timeout_check = Instant::now();

        let ids: Vec<u64> = self.sessions.keys().copied().collect();
        for id in ids {
            let Some(entry) = self.sessions.get_mut(&id) else {
                continue;
            };
            let state_before = entry.session.state();
            entry.session.tick();
            Self::flush_session_io(&self.handle, entry);
            if state_before == SessionState::Started
                && entry.session.state() == SessionState::Stopping
            {
                self.zombies.push(Zombie {
                    session_id: id,
                    since: Instant::now(),
                });
            }
        }
    }

    /// Finalize stopping sessions whose backends have settled or whose
    /// grace period has passed.
    fn delete_zombies(&mut self) {
        if self.zombies.is_empty() {
            return;
        }
        let mut keep = Vec::new();
        let zombies = std::mem::take(&mut self.zombies);

        for zombie in zombies {
            let Some(entry) = self.sessions.get_mut(&zombie.session_id) else {
                continue;
            };

            let backends_settled = match entry.session.router_session_mut() {
                Some(router) => router
                    .endpoints_mut()
                    .iter()
                    .all(|ep| ep.conn().map_or(true, |conn| conn.can_close())),
                None => true,
            };

            if backends_settled || zombie.since.elapsed() >= ZOMBIE_GRACE {
                self.finalize_session(zombie.session_id);
            } else {
                keep.push(zombie);
            }
        }
        self.zombies = keep;
    }

    fn finalize_session(&mut self, id: u64) {
        let Some(mut entry) = self.sessions.remove(&id) else {
            return;
        };
        self.handle
            .session_count
            .store(self.sessions.len(), Ordering::Release);

        // Release backends: poolable ones go to the pool, the rest are
        // destroyed.
        let can_pool = entry.session.can_pool_backends();
        if let Some(router) = entry.session.router_session_mut() {
            for endpoint in router.endpoints_mut() {
                if let Some(conn) = endpoint.take_conn() {
                    let server = Arc::clone(conn.server());
                    match self
                        .handle
                        .pools
                        .try_pool_connection(conn, can_pool, self.handle.n_created())
                    {
                        Ok(()) => {}
                        Err(_conn) => {
                            server.stats().remove_connection();
                            self.handle.pools.activate_waiting();
                        }
                    }
                }
            }
        }

        if let Some(mut client) = entry.client.take() {
            self.token_map.remove(&client.token);
            let _ = self.poll.registry().deregister(&mut client.stream);
        }

        if entry.session.release() {
            entry.session.finalize();
        }
        log::debug!("[WORKER] {}: session {id} finalized", self.handle.index);
    }

    fn run_tick_tasks(&mut self) {
        let now = Instant::now();
        let due: Vec<TickTask> = self
            .ticks
            .iter_mut()
            .filter(|tick| tick.next <= now)
            .map(|tick| {
                tick.next = now + tick.every;
                tick.task
            })
            .collect();

        for task in due {
            match task {
                TickTask::PoolSweep => {
                    let evicted = self.handle.pools.close_expired();
                    for conn in &evicted {
                        conn.server().stats().remove_connection();
                    }
                    if !evicted.is_empty() {
                        log::debug!(
                            "[WORKER] {}: evicted {} pooled connections",
                            self.handle.index,
                            evicted.len()
                        );
                    }
                }
                TickTask::ActivateWaiting => self.activate_waiting_endpoints(),
                TickTask::FailTimedOut => self.fail_timed_out_endpoints(),
            }
        }
    }

    fn run_dcalls(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        for (index, dcall) in self.dcalls.iter_mut().enumerate() {
            if dcall.next <= now {
                dcall.next = now + dcall.every;
                if let Some(func) = dcall.func.take() {
                    due.push((index, func));
                }
            }
        }
        let mut dead = Vec::new();
        for (index, mut func) in due {
            if func(self) {
                if let Some(slot) = self.dcalls.get_mut(index) {
                    slot.func = Some(func);
                }
            } else {
                dead.push(index);
            }
        }
        for index in dead.into_iter().rev() {
            self.dcalls.remove(index);
        }
        self.dcalls.retain(|dcall| dcall.func.is_some());
    }

    /// Register a deferred call with a period. The call runs on this
    /// worker's loop; returning `false` deregisters it.
    pub fn delayed_call(&mut self, every: Duration, func: DeferredCall) {
        self.dcalls.push(DCall {
            next: Instant::now() + every,
            every,
            func: Some(func),
        });
    }

    /// Wake endpoints queued for connection slots, FIFO per server.
    pub fn activate_waiting_endpoints(&mut self) {
        for session_id in self.handle.pools.activate_waiting() {
            // The session retries routing; the router's connect() will
            // now find a free slot.
            if let Some(entry) = self.sessions.get_mut(&session_id) {
                entry.session.log("connection slot available, retrying");
            }
        }
    }

    /// Fail sessions whose endpoints outwaited their multiplex timeout.
    pub fn fail_timed_out_endpoints(&mut self) {
        for session_id in self.handle.pools.fail_timed_out_waiters() {
            log::warn!(
                "[WORKER] {}: session {session_id} timed out waiting for a connection",
                self.handle.index
            );
            self.kill_session(session_id, KillReason::TooManyConnections);
        }
    }

    // ------------------------------------------------------------------
    // Socket I/O
    // ------------------------------------------------------------------

    fn dispatch_socket_event(&mut self, token: Token, readable: bool, writable: bool, error: bool) {
        let Some(&(session_id, conn_id)) = self.token_map.get(&token) else {
            return;
        };

        if conn_id == 0 {
            self.client_socket_event(session_id, readable, writable, error);
        } else {
            self.backend_socket_event(session_id, conn_id, readable, error);
        }
    }

    fn client_socket_event(&mut self, session_id: u64, readable: bool, writable: bool, error: bool) {
        if error {
            self.handle.stats.hangups.fetch_add(1, Ordering::Relaxed);
            self.close_session(session_id);
            return;
        }

        if readable {
            self.handle.stats.reads.fetch_add(1, Ordering::Relaxed);
            let packets = {
                let Some(entry) = self.sessions.get_mut(&session_id) else {
                    return;
                };
                let Some(client) = entry.client.as_mut() else {
                    return;
                };
                match read_available(&mut client.stream, &mut client.decoder) {
                    Ok(Some(packets)) => packets,
                    Ok(None) => {
                        // Orderly client disconnect.
                        self.close_session(session_id);
                        return;
                    }
                    Err(error) => {
                        log::info!("[WORKER] client read failed: {error}");
                        self.handle.stats.errors.fetch_add(1, Ordering::Relaxed);
                        self.close_session(session_id);
                        return;
                    }
                }
            };

            // Packets from a single client are delivered in arrival order.
            for packet in packets {
                if !self.route_query(session_id, packet) {
                    return;
                }
            }
        }

        if writable {
            if let Some(entry) = self.sessions.get_mut(&session_id) {
                Self::flush_client(&self.handle, entry);
            }
        }
    }

    fn backend_socket_event(&mut self, session_id: u64, conn_id: u64, readable: bool, error: bool) {
        if error {
            self.handle.stats.hangups.fetch_add(1, Ordering::Relaxed);
            if let Some(entry) = self.sessions.get_mut(&session_id) {
                if let Some(router) = entry.session.router_session_mut() {
                    for endpoint in router.endpoints_mut() {
                        if endpoint.conn().map_or(false, |c| c.id() == conn_id) {
                            if let Some(conn) = endpoint.conn_mut() {
                                conn.set_hanged_up();
                            }
                        }
                    }
                }
            }
            return;
        }
        if !readable {
            return;
        }
        self.handle.stats.reads.fetch_add(1, Ordering::Relaxed);

        // Phase one: read and decode while the endpoint is borrowed.
        let decoded = {
            let Some(entry) = self.sessions.get_mut(&session_id) else {
                return;
            };
            let Some(router) = entry.session.router_session_mut() else {
                return;
            };
            let mut decoded = None;
            for endpoint in router.endpoints_mut() {
                let server_id = endpoint.target();
                if let Some(conn) = endpoint.conn_mut() {
                    if conn.id() != conn_id {
                        continue;
                    }
                    conn.mark_read();
                    let mut raw = Vec::new();
                    if let Some(stream) = conn.stream_mut() {
                        let mut buf = [0u8; 16 * 1024];
                        loop {
                            match stream.read(&mut buf) {
                                Ok(0) => break,
                                Ok(n) => raw.extend_from_slice(&buf[..n]),
                                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                                Err(_) => break,
                            }
                        }
                    }
                    let packets = conn.decoder_mut().feed(&raw);
                    decoded = Some((server_id, packets));
                    break;
                }
            }
            decoded
        };

        // Phase two: deliver in arrival order.
        if let Some((server_id, packets)) = decoded {
            let route = ReplyRoute { source: server_id };
            for packet in packets {
                if !self.deliver_reply(session_id, packet, route) {
                    return;
                }
            }
        }
    }

    /// Flush staged bytes in both directions for one session.
    fn flush_session_io(handle: &Arc<WorkerHandle>, entry: &mut SessionEntry) {
        // Backend writes staged by the router's endpoints.
        if let Some(router) = entry.session.router_session_mut() {
            for endpoint in router.endpoints_mut() {
                if let Some(conn) = endpoint.conn_mut() {
                    if conn.write_buf().is_empty() {
                        continue;
                    }
                    let staged = std::mem::take(conn.write_buf());
                    match conn.stream_mut() {
                        Some(stream) => match write_all_nonblocking(stream, &staged) {
                            Ok(rest) => {
                                *conn.write_buf() = rest;
                                handle.stats.writes.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(_) => {
                                conn.set_hanged_up();
                                handle.stats.errors.fetch_add(1, Ordering::Relaxed);
                            }
                        },
                        // Detached connection: writes stay staged for the
                        // protocol layer (or a test) to inspect.
                        None => *conn.write_buf() = staged,
                    }
                }
            }
        }
        Self::flush_client(handle, entry);
    }

    fn flush_client(handle: &Arc<WorkerHandle>, entry: &mut SessionEntry) {
        let packets = entry.session.take_client_output();
        let Some(client) = entry.client.as_mut() else {
            // Socketless session: nothing to flush; output was consumed
            // by the caller via take_client_output before this point.
            for packet in packets {
                entry.session.log(format!(
                    "dropped {} bytes of client output (no socket)",
                    packet.as_wire().len()
                ));
            }
            return;
        };
        for packet in packets {
            client.out_buf.extend_from_slice(packet.as_wire());
        }
        if client.out_buf.is_empty() {
            return;
        }
        let staged = std::mem::take(&mut client.out_buf);
        match write_all_nonblocking(&mut client.stream, &staged) {
            Ok(rest) => {
                client.out_buf = rest;
                handle.stats.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                log::info!("[WORKER] client write failed: {error}");
                handle.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // ------------------------------------------------------------------
    // Rebalancing
    // ------------------------------------------------------------------

    /// Note a rebalance; it is performed from the tick.
    pub fn note_rebalance(&mut self, to: Arc<WorkerHandle>, n_sessions: usize) {
        self.pending_rebalance = Some(PendingRebalance { to, n_sessions });
    }

    fn perform_rebalance(&mut self) {
        let Some(pending) = self.pending_rebalance.take() else {
            return;
        };

        let movable: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, entry)| entry.session.is_movable())
            .map(|(&id, _)| id)
            .take(pending.n_sessions)
            .collect();

        if movable.is_empty() && !self.sessions.is_empty() {
            log::info!(
                "[WORKER] {}: no movable sessions, rebalance skipped",
                self.handle.index
            );
            return;
        }

        for id in movable {
            self.move_session_to(id, &pending.to);
        }
    }

    // ------------------------------------------------------------------
    // Deactivation and shutdown
    // ------------------------------------------------------------------

    /// Clear thread-local caches and close the pools. Runs when a drained
    /// worker becomes inactive, and again at shutdown.
    pub fn deactivate(&mut self) {
        let released = self.storage.clear();
        let evicted = self.handle.pools.close_all(None);
        for conn in &evicted {
            conn.server().stats().remove_connection();
        }
        self.handle.set_state(WorkerState::Inactive);
        self.handle.set_listening(false);
        log::info!(
            "[WORKER] {}: deactivated, {released} bytes of thread-local caches released, \
             {} pooled connections closed",
            self.handle.index,
            evicted.len()
        );
    }

    /// Progress towards shutdown: close pooled connections, kill the
    /// remaining sessions, exit the loop once the session set is empty.
    pub fn try_shutdown(&mut self) {
        let evicted = self.handle.pools.close_all(None);
        for conn in &evicted {
            conn.server().stats().remove_connection();
        }
        let ids: Vec<u64> = self.sessions.keys().copied().collect();
        for id in ids {
            self.kill_session(id, KillReason::Killed);
        }
        self.delete_zombies();
        if self.sessions.is_empty() {
            self.running = false;
        }
    }

    /// Drained worker with no sessions left: deactivate in place.
    pub(super) fn maybe_deactivate(&mut self) {
        if self.handle.state() == WorkerState::Draining && self.sessions.is_empty() {
            self.deactivate();
        }
    }
}

/// Read until `WouldBlock`; `Ok(None)` signals EOF.
fn read_available(
    stream: &mut TcpStream,
    decoder: &mut crate::protocol::FrameDecoder,
) -> io::Result<Option<Vec<Packet>>> {
    let mut packets = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    let mut saw_eof = false;
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                saw_eof = true;
                break;
            }
            Ok(n) => packets.extend(decoder.feed(&buf[..n])),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    if saw_eof && packets.is_empty() {
        Ok(None)
    } else {
        Ok(Some(packets))
    }
}

/// Write as much as the socket accepts; the unsent tail is returned.
fn write_all_nonblocking(stream: &mut TcpStream, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut offset = 0;
    while offset < data.len() {
        match stream.write(&data[offset..]) {
            Ok(0) => break,
            Ok(n) => offset += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(data[offset..].to_vec())
}
