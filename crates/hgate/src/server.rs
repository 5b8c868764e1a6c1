// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Backend server entity.
//!
//! A `Server` describes one MariaDB/MySQL backend: its address, runtime
//! status as maintained by the monitor boundary, connection statistics and
//! pooling knobs. Shared across workers behind an `Arc`; all mutable state
//! is atomic.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Stable identifier of a server within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub u32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server-{}", self.0)
    }
}

/// Where a backend listens: TCP endpoint, or UNIX socket when the
/// configured address starts with `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    Tcp { host: String, port: u16 },
    Unix { path: String },
}

impl ServerAddress {
    /// Parse the configured address string. A leading `/` selects a UNIX
    /// socket; anything else is a TCP host.
    pub fn parse(address: &str, port: u16) -> Self {
        if address.starts_with('/') {
            ServerAddress::Unix {
                path: address.to_string(),
            }
        } else {
            ServerAddress::Tcp {
                host: address.to_string(),
                port,
            }
        }
    }
}

/// Connection statistics, updated by workers and read by the admin
/// surface. Relaxed ordering is sufficient for monotonic counters; the
/// intent counter pairs with acquire/release because it gates admission.
#[derive(Debug, Default)]
pub struct ServerStats {
    n_current: AtomicI64,
    n_intents: AtomicI64,
    n_total: AtomicU64,
    n_from_pool: AtomicU64,
    n_max: AtomicI64,
}

impl ServerStats {
    pub fn n_current_conns(&self) -> i64 {
        self.n_current.load(Ordering::Acquire)
    }

    pub fn n_conn_intents(&self) -> i64 {
        self.n_intents.load(Ordering::Acquire)
    }

    pub fn n_total_conns(&self) -> u64 {
        self.n_total.load(Ordering::Relaxed)
    }

    pub fn n_from_pool(&self) -> u64 {
        self.n_from_pool.load(Ordering::Relaxed)
    }

    pub fn n_max_conns(&self) -> i64 {
        self.n_max.load(Ordering::Relaxed)
    }

    pub fn add_connection(&self) {
        let now = self.n_current.fetch_add(1, Ordering::AcqRel) + 1;
        self.n_total.fetch_add(1, Ordering::Relaxed);
        self.n_max.fetch_max(now, Ordering::Relaxed);
    }

    pub fn remove_connection(&self) {
        let prev = self.n_current.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "connection count went negative");
    }

    pub fn add_from_pool(&self) {
        self.n_from_pool.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark the intent to create a connection; returns the intent count
    /// including this one. Pair with [`ServerStats::remove_conn_intent`].
    pub fn add_conn_intent(&self) -> i64 {
        self.n_intents.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn remove_conn_intent(&self) {
        self.n_intents.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One backend server.
#[derive(Debug)]
pub struct Server {
    id: ServerId,
    name: String,
    address: ServerAddress,

    /// Maintained by the monitor boundary.
    running: AtomicBool,
    maintenance: AtomicBool,

    /// Global cap on pooled (idle persistent) connections across all
    /// workers; 0 disables pooling.
    persist_pool_max: AtomicI64,
    /// Maximum age of a pooled connection, in milliseconds; 0 disables
    /// age-based eviction.
    persist_max_time_ms: AtomicU64,
    /// Cap on concurrent routing connections; 0 means unlimited.
    max_routing_connections: AtomicI64,
    proxy_protocol: AtomicBool,

    stats: ServerStats,
}

impl Server {
    pub fn new(id: ServerId, name: impl Into<String>, address: ServerAddress) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            address,
            running: AtomicBool::new(true),
            maintenance: AtomicBool::new(false),
            persist_pool_max: AtomicI64::new(0),
            persist_max_time_ms: AtomicU64::new(0),
            max_routing_connections: AtomicI64::new(0),
            proxy_protocol: AtomicBool::new(false),
            stats: ServerStats::default(),
        })
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.maintenance.load(Ordering::Acquire)
    }

    /// Monitor boundary: mark the server up or down.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn set_maintenance(&self, maintenance: bool) {
        self.maintenance.store(maintenance, Ordering::Release);
    }

    pub fn persist_pool_max(&self) -> i64 {
        self.persist_pool_max.load(Ordering::Acquire)
    }

    pub fn set_persist_pool_max(&self, max: i64) {
        self.persist_pool_max.store(max, Ordering::Release);
    }

    pub fn persistent_conns_enabled(&self) -> bool {
        self.persist_pool_max() > 0
    }

    pub fn persist_max_time(&self) -> Duration {
        Duration::from_millis(self.persist_max_time_ms.load(Ordering::Acquire))
    }

    pub fn set_persist_max_time(&self, max_age: Duration) {
        self.persist_max_time_ms
            .store(max_age.as_millis() as u64, Ordering::Release);
    }

    pub fn max_routing_connections(&self) -> i64 {
        self.max_routing_connections.load(Ordering::Acquire)
    }

    pub fn set_max_routing_connections(&self, max: i64) {
        self.max_routing_connections.store(max, Ordering::Release);
    }

    pub fn proxy_protocol(&self) -> bool {
        self.proxy_protocol.load(Ordering::Relaxed)
    }

    pub fn set_proxy_protocol(&self, enabled: bool) {
        self.proxy_protocol.store(enabled, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        assert_eq!(
            ServerAddress::parse("/var/run/mysqld.sock", 3306),
            ServerAddress::Unix {
                path: "/var/run/mysqld.sock".into()
            }
        );
        assert_eq!(
            ServerAddress::parse("db1.local", 3306),
            ServerAddress::Tcp {
                host: "db1.local".into(),
                port: 3306
            }
        );
    }

    #[test]
    fn test_stats_counters() {
        let stats = ServerStats::default();
        stats.add_connection();
        stats.add_connection();
        stats.remove_connection();

        assert_eq!(stats.n_current_conns(), 1);
        assert_eq!(stats.n_total_conns(), 2);
        assert_eq!(stats.n_max_conns(), 2);
    }

    #[test]
    fn test_intents() {
        let stats = ServerStats::default();
        assert_eq!(stats.add_conn_intent(), 1);
        assert_eq!(stats.add_conn_intent(), 2);
        stats.remove_conn_intent();
        assert_eq!(stats.n_conn_intents(), 1);
    }

    #[test]
    fn test_maintenance_counts_as_down() {
        let server = Server::new(ServerId(1), "db1", ServerAddress::parse("127.0.0.1", 3306));
        assert!(server.is_running());
        server.set_maintenance(true);
        assert!(!server.is_running());
    }
}
