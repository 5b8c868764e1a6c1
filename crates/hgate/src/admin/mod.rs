// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Admin surface snapshots and JSON rendering (serde-free).
//!
//! The admin boundary is external; this module provides the snapshots it
//! reads and the JSON-API shapes it serves. Minimal resource object:
//! `{id, type, attributes, links}`; collections are
//! `{data: [...], links: {self}}`.

use crate::engine::{WorkerState, Workers};

/// Self-link base for worker resources.
pub const THREADS_BASE: &str = "/threads";
/// Self-link base for query-classifier cache statistics.
pub const QC_STATS_BASE: &str = "/qc_stats";
/// Self-link for the memory document.
pub const MEMORY_BASE: &str = "/memory";

/// Point-in-time view of one routing worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub index: usize,
    pub state: WorkerState,
    pub listening: bool,
    pub sessions: usize,
    pub load: u32,
    pub average_load: u32,
    pub reads: u64,
    pub writes: u64,
    pub errors: u64,
    pub hangups: u64,
    pub accepts: u64,
    pub pooled_connections: usize,
}

/// Per-worker cache statistics for the `/qc_stats` collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size: u64,
    pub inserts: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Process memory document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub session_bytes: usize,
    pub pooled_connection_count: usize,
    pub worker_storage_bytes: usize,
}

/// Snapshot every worker in index order.
pub fn worker_snapshots(workers: &Workers) -> Vec<WorkerSnapshot> {
    workers
        .handles()
        .iter()
        .map(|handle| WorkerSnapshot {
            index: handle.index(),
            state: handle.state(),
            listening: handle.is_listening(),
            sessions: handle.session_count(),
            load: handle.load(),
            average_load: handle.average_load(),
            reads: handle.stats().reads.load(std::sync::atomic::Ordering::Relaxed),
            writes: handle.stats().writes.load(std::sync::atomic::Ordering::Relaxed),
            errors: handle.stats().errors.load(std::sync::atomic::Ordering::Relaxed),
            hangups: handle.stats().hangups.load(std::sync::atomic::Ordering::Relaxed),
            accepts: handle.stats().accepts.load(std::sync::atomic::Ordering::Relaxed),
            pooled_connections: handle.pools().total_pooled(),
        })
        .collect()
}

fn worker_state_str(state: WorkerState) -> &'static str {
    match state {
        WorkerState::Active => "Active",
        WorkerState::Draining => "Draining",
        WorkerState::Inactive => "Inactive",
    }
}

/// Render one worker as a JSON-API resource object.
pub fn format_json_worker(snapshot: &WorkerSnapshot) -> String {
    format!(
        r#"{{"id":"{id}","type":"threads","attributes":{{"state":"{state}","listening":{listening},"sessions":{sessions},"load":{{"one_second":{load},"average":{avg}}},"stats":{{"reads":{reads},"writes":{writes},"errors":{errors},"hangups":{hangups},"accepts":{accepts},"pooled_connections":{pooled}}}}},"links":{{"self":"{base}/{id}"}}}}"#,
        id = snapshot.index,
        state = worker_state_str(snapshot.state),
        listening = snapshot.listening,
        sessions = snapshot.sessions,
        load = snapshot.load,
        avg = snapshot.average_load,
        reads = snapshot.reads,
        writes = snapshot.writes,
        errors = snapshot.errors,
        hangups = snapshot.hangups,
        accepts = snapshot.accepts,
        pooled = snapshot.pooled_connections,
        base = THREADS_BASE,
    )
}

/// Render the `/threads` collection.
pub fn format_json_workers(snapshots: &[WorkerSnapshot]) -> String {
    let data: Vec<String> = snapshots.iter().map(format_json_worker).collect();
    format!(
        r#"{{"data":[{}],"links":{{"self":"{}"}}}}"#,
        data.join(","),
        THREADS_BASE
    )
}

/// Render one worker's classifier-cache statistics.
pub fn format_json_qc_stats(index: usize, stats: &CacheStats) -> String {
    format!(
        r#"{{"id":"{index}","type":"qc_stats","attributes":{{"size":{},"inserts":{},"hits":{},"misses":{},"evictions":{}}},"links":{{"self":"{QC_STATS_BASE}/{index}"}}}}"#,
        stats.size, stats.inserts, stats.hits, stats.misses, stats.evictions,
    )
}

/// Render the `/memory` document.
pub fn format_json_memory(snapshot: &MemorySnapshot) -> String {
    format!(
        r#"{{"id":"memory","type":"memory","attributes":{{"session_bytes":{},"pooled_connection_count":{},"worker_storage_bytes":{}}},"links":{{"self":"{MEMORY_BASE}"}}}}"#,
        snapshot.session_bytes, snapshot.pooled_connection_count, snapshot.worker_storage_bytes,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> WorkerSnapshot {
        WorkerSnapshot {
            index: 3,
            state: WorkerState::Active,
            listening: true,
            sessions: 12,
            load: 40,
            average_load: 35,
            reads: 100,
            writes: 90,
            errors: 1,
            hangups: 2,
            accepts: 15,
            pooled_connections: 4,
        }
    }

    #[test]
    fn test_worker_resource_shape() {
        let json = format_json_worker(&snapshot());
        assert!(json.contains(r#""id":"3""#));
        assert!(json.contains(r#""type":"threads""#));
        assert!(json.contains(r#""state":"Active""#));
        assert!(json.contains(r#""self":"/threads/3""#));
        assert!(json.contains(r#""one_second":40"#));
    }

    #[test]
    fn test_collection_shape() {
        let json = format_json_workers(&[snapshot()]);
        assert!(json.starts_with(r#"{"data":["#));
        assert!(json.ends_with(r#""links":{"self":"/threads"}}"#));
    }

    #[test]
    fn test_qc_stats_link() {
        let json = format_json_qc_stats(1, &CacheStats::default());
        assert!(json.contains(r#""self":"/qc_stats/1""#));
    }

    #[test]
    fn test_memory_document() {
        let json = format_json_memory(&MemorySnapshot {
            session_bytes: 2048,
            pooled_connection_count: 3,
            worker_storage_bytes: 512,
        });
        assert!(json.contains(r#""session_bytes":2048"#));
        assert!(json.contains(r#""self":"/memory""#));
    }

    #[test]
    fn test_live_workers_snapshot() {
        let workers = Workers::new(2, 10).unwrap();
        let snapshots = worker_snapshots(&workers);
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].index, 0);
        assert_eq!(snapshots[1].index, 1);
        workers.shutdown();
    }
}
