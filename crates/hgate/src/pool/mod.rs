// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-worker backend connection pooling and admission control.
//!
//! Each routing worker keeps one [`ConnectionPool`] per backend server,
//! holding idle reusable connections. The pools hang off a [`PoolGroup`]
//! guarded by a mutex because admin threads inspect the statistics; the
//! critical sections are brief.
//!
//! Admission control: when a server's `max_routing_connections` cap is
//! reached, the asking endpoint is queued FIFO per server and woken when a
//! connection is released, or failed once its multiplex timeout passes.

pub mod backend;
pub mod endpoint;

pub use backend::{BackendConn, ConnIdentity, ReuseQuality};
pub use endpoint::{ConnectOutcome, ServerEndpoint};

use crate::server::{Server, ServerId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pool statistics, exposed on the admin surface.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub curr_size: usize,
    pub max_size: usize,
    pub times_found: u64,
    pub times_empty: u64,
}

/// Idle connections for one server on one worker.
#[derive(Debug)]
pub struct ConnectionPool {
    server: Arc<Server>,
    contents: Vec<BackendConn>,
    capacity: usize,
    stats: PoolStats,
}

impl ConnectionPool {
    fn new(server: Arc<Server>, global_capacity: i64, n_workers: usize) -> Self {
        let mut pool = Self {
            server,
            contents: Vec::new(),
            capacity: 0,
            stats: PoolStats::default(),
        };
        pool.set_capacity(global_capacity, n_workers);
        pool
    }

    /// Recompute the per-worker share of the global pool capacity.
    pub fn set_capacity(&mut self, global_capacity: i64, n_workers: usize) {
        self.capacity = if n_workers == 0 {
            0
        } else {
            (global_capacity.max(0) as usize) / n_workers
        };
    }

    pub fn has_space(&self) -> bool {
        self.contents.len() < self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            curr_size: self.contents.len(),
            ..self.stats
        }
    }

    /// Take the best-matching idle connection for `identity`. A linear
    /// scan; optimal reuse short-circuits.
    pub fn get(&mut self, identity: &ConnIdentity) -> Option<(ReuseQuality, BackendConn)> {
        let mut best: Option<(ReuseQuality, usize)> = None;

        for (index, conn) in self.contents.iter().enumerate() {
            let quality = conn.can_reuse(identity);
            if quality == ReuseQuality::NotPossible {
                continue;
            }
            let better = match best {
                Some((best_quality, _)) => quality > best_quality,
                None => true,
            };
            if better {
                best = Some((quality, index));
                if quality == ReuseQuality::Optimal {
                    break;
                }
            }
        }

        match best {
            Some((quality, index)) => {
                self.stats.times_found += 1;
                Some((quality, self.contents.swap_remove(index)))
            }
            None => {
                self.stats.times_empty += 1;
                None
            }
        }
    }

    /// Insert an idle connection if there is space.
    pub fn add(&mut self, conn: BackendConn) -> Result<(), BackendConn> {
        if !self.has_space() {
            return Err(conn);
        }
        self.contents.push(conn);
        self.stats.max_size = self.stats.max_size.max(self.contents.len());
        Ok(())
    }

    /// Evict hung-up and aged-out entries, and trim over-capacity entries
    /// left behind by a runtime capacity decrease. Returns the evicted
    /// connections for the caller to close.
    pub fn close_expired(&mut self) -> Vec<BackendConn> {
        let max_age = self.server.persist_max_time();
        let now = Instant::now();
        let mut evicted = Vec::new();

        let mut index = 0;
        while index < self.contents.len() {
            let entry = &self.contents[index];
            let expired = !max_age.is_zero() && now.duration_since(entry.created()) > max_age;
            if entry.hanged_up() || expired {
                evicted.push(self.contents.swap_remove(index));
            } else {
                index += 1;
            }
        }

        while self.contents.len() > self.capacity {
            evicted.push(self.contents.swap_remove(0));
        }

        evicted
    }

    /// Empty the pool; used on server down, worker deactivation and
    /// shutdown. Returns the evicted connections.
    pub fn close_all(&mut self) -> Vec<BackendConn> {
        std::mem::take(&mut self.contents)
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}

/// An endpoint queued for a connection slot on a capped server.
#[derive(Debug, Clone)]
struct Waiter {
    session_id: u64,
    since: Instant,
    timeout: Duration,
}

/// A connection acquired from the pool group, or the reason there is none.
#[derive(Debug)]
pub struct ConnectionResult {
    pub conn: Option<(ReuseQuality, BackendConn)>,
    /// The server's routing-connection cap is reached; the caller should
    /// enqueue its endpoint via [`PoolGroup::enqueue_waiter`].
    pub conn_limit_reached: bool,
}

/// All pools of one worker, plus the per-server FIFO of endpoints waiting
/// for a connection slot.
///
/// Shared between the owning worker and admin threads (statistics reads
/// only); every access is a brief critical section.
pub struct PoolGroup {
    servers: Mutex<HashMap<ServerId, Arc<Server>>>,
    pools: Mutex<HashMap<ServerId, ConnectionPool>>,
    waiting: Mutex<HashMap<ServerId, VecDeque<Waiter>>>,
}

impl Default for PoolGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolGroup {
    pub fn new() -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Make a server known to this worker.
    pub fn register_server(&self, server: Arc<Server>) {
        self.servers.lock().insert(server.id(), server);
    }

    pub fn server(&self, id: ServerId) -> Option<Arc<Server>> {
        self.servers.lock().get(&id).cloned()
    }

    /// Acquire a backend connection for `server`: pool first, then a new
    /// connection within the server's routing cap.
    ///
    /// The cap is enforced with an intent counter: the intent is marked,
    /// the count re-checked, and the intent removed once the connection is
    /// created or abandoned. This avoids overshoot without a lock across
    /// workers.
    pub fn get_backend_connection(
        &self,
        server: &Arc<Server>,
        identity: &ConnIdentity,
    ) -> ConnectionResult {
        if server.persistent_conns_enabled() && server.is_running() {
            if let Some(found) = self.pool_get(server, identity) {
                server.stats().add_from_pool();
                return ConnectionResult {
                    conn: Some(found),
                    conn_limit_reached: false,
                };
            }
        }

        let max_allowed = server.max_routing_connections();
        let stats = server.stats();

        if max_allowed > 0 {
            let current = stats.n_current_conns() + stats.n_conn_intents();
            if current >= max_allowed {
                // All slots look taken. Pessimistic when an intended
                // connection fails on another worker, but safe.
                return ConnectionResult {
                    conn: None,
                    conn_limit_reached: true,
                };
            }

            let intents = stats.add_conn_intent();
            let result = if intents + stats.n_current_conns() <= max_allowed {
                let conn = BackendConn::new(Arc::clone(server), identity.clone(), None);
                stats.add_connection();
                ConnectionResult {
                    conn: Some((ReuseQuality::NotPossible, conn)),
                    conn_limit_reached: false,
                }
            } else {
                ConnectionResult {
                    conn: None,
                    conn_limit_reached: true,
                }
            };
            stats.remove_conn_intent();
            result
        } else {
            let conn = BackendConn::new(Arc::clone(server), identity.clone(), None);
            stats.add_connection();
            ConnectionResult {
                conn: Some((ReuseQuality::NotPossible, conn)),
                conn_limit_reached: false,
            }
        }
    }

    fn pool_get(
        &self,
        server: &Arc<Server>,
        identity: &ConnIdentity,
    ) -> Option<(ReuseQuality, BackendConn)> {
        let mut pools = self.pools.lock();
        let pool = pools.get_mut(&server.id())?;

        while let Some((quality, mut conn)) = pool.get(identity) {
            if conn.prepare_reuse(identity.clone(), quality) {
                return Some((quality, conn));
            }
            // Reusing this candidate failed; close it and try another.
            log::warn!("[POOL] failed to reuse a persistent connection to {}", server.name());
            server.stats().remove_connection();
        }
        None
    }

    /// Try to park a released connection in its server's pool.
    ///
    /// Pooling requires: the connection is polling without a hangup, its
    /// protocol is established, the releasing session allows pooling, the
    /// server is running, and the pool has space. Returns the connection
    /// back to the caller otherwise.
    pub fn try_pool_connection(
        &self,
        conn: BackendConn,
        can_pool: bool,
        n_workers: usize,
    ) -> Result<(), BackendConn> {
        let server = Arc::clone(conn.server());
        let global_cap = server.persist_pool_max();

        let poolable = global_cap > 0
            && conn.is_polling()
            && !conn.hanged_up()
            && conn.established()
            && can_pool
            && server.is_running();
        if !poolable {
            return Err(conn);
        }

        let mut pools = self.pools.lock();
        let pool = pools
            .entry(server.id())
            .or_insert_with(|| ConnectionPool::new(Arc::clone(&server), global_cap, n_workers));
        pool.add(conn)
    }

    /// Periodic sweep: evict expired and hung-up pooled connections.
    /// Returns the evicted connections for the worker to close.
    pub fn close_expired(&self) -> Vec<BackendConn> {
        let mut evicted = Vec::new();
        let mut pools = self.pools.lock();
        for pool in pools.values_mut() {
            evicted.append(&mut pool.close_expired());
        }
        evicted
    }

    /// Close every pooled connection, optionally for a single server.
    /// Used on server down, worker deactivation and shutdown.
    pub fn close_all(&self, server: Option<ServerId>) -> Vec<BackendConn> {
        let mut pools = self.pools.lock();
        match server {
            Some(id) => pools
                .remove(&id)
                .map(|mut pool| pool.close_all())
                .unwrap_or_default(),
            None => {
                let mut evicted = Vec::new();
                for (_, mut pool) in pools.drain() {
                    evicted.append(&mut pool.close_all());
                }
                evicted
            }
        }
    }

    /// Recompute every pool's per-worker capacity after the worker count
    /// or a server's global cap changed.
    pub fn recompute_capacities(&self, n_workers: usize) {
        let mut pools = self.pools.lock();
        for pool in pools.values_mut() {
            let global = pool.server.persist_pool_max();
            pool.set_capacity(global, n_workers);
        }
    }

    pub fn stats(&self, server: ServerId) -> Option<PoolStats> {
        self.pools.lock().get(&server).map(|pool| pool.stats())
    }

    pub fn total_pooled(&self) -> usize {
        self.pools.lock().values().map(|pool| pool.len()).sum()
    }

    // ------------------------------------------------------------------
    // Admission waiting list
    // ------------------------------------------------------------------

    /// Queue a session's endpoint for a connection slot on `server`.
    pub fn enqueue_waiter(
        &self,
        server: ServerId,
        session_id: u64,
        timeout: Duration,
    ) {
        self.waiting
            .lock()
            .entry(server)
            .or_default()
            .push_back(Waiter {
                session_id,
                since: Instant::now(),
                timeout,
            });
    }

    pub fn remove_waiter(&self, server: ServerId, session_id: u64) {
        if let Some(queue) = self.waiting.lock().get_mut(&server) {
            queue.retain(|waiter| waiter.session_id != session_id);
        }
    }

    /// True when some endpoint is waiting for a slot on `server`.
    pub fn conn_to_server_needed(&self, server: ServerId) -> bool {
        self.waiting
            .lock()
            .get(&server)
            .is_some_and(|queue| !queue.is_empty())
    }

    /// Pop the longest-waiting endpoints, FIFO per server, up to the free
    /// slots each server reports. The worker retries their connection
    /// attempts.
    pub fn activate_waiting(&self) -> Vec<u64> {
        let servers = self.servers.lock().clone();
        let mut waiting = self.waiting.lock();
        let mut activated = Vec::new();

        for (server_id, queue) in waiting.iter_mut() {
            let Some(server) = servers.get(server_id) else {
                continue;
            };
            let max = server.max_routing_connections();
            let mut free = if max > 0 {
                let stats = server.stats();
                (max - stats.n_current_conns() - stats.n_conn_intents()).max(0)
            } else {
                i64::MAX
            };
            while free > 0 {
                match queue.pop_front() {
                    Some(waiter) => {
                        activated.push(waiter.session_id);
                        free -= 1;
                    }
                    None => break,
                }
            }
        }
        activated
    }

    /// Drop waiters whose multiplex timeout has passed; the worker fails
    /// their sessions with `TOO_MANY_CONNECTIONS`.
    pub fn fail_timed_out_waiters(&self) -> Vec<u64> {
        let now = Instant::now();
        let mut failed = Vec::new();
        for queue in self.waiting.lock().values_mut() {
            queue.retain(|waiter| {
                if now.duration_since(waiter.since) > waiter.timeout {
                    failed.push(waiter.session_id);
                    false
                } else {
                    true
                }
            });
        }
        failed
    }
}
