// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The concurrency substrate: routing workers, the main worker, worker
//! scaling, load rebalancing, per-worker storage and liveness.
//!
//! One OS thread per routing worker, one for the main worker. Within a
//! worker, execution is single-threaded and cooperative; cross-worker
//! calls are the only permitted way to touch another worker's state.

pub mod main_worker;
pub mod rebalance;
pub mod storage;
pub mod watchdog;
pub mod worker;
pub mod workers;

pub use main_worker::{ticks, MainWorker, MainWorkerConfig, TaskFn};
pub use rebalance::{AverageN, RebalancePlan};
pub use storage::{create_key, IndexedStorage, StorageKey};
pub use watchdog::{LivenessProbe, WatchdogNotifier};
pub use worker::{
    current_worker_index, RoutingWorker, WorkerHandle, WorkerState, WorkerStats, WorkerTask,
};
pub use workers::{Workers, N_MAX};
