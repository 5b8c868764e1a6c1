// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The routing worker set.
//!
//! Four monotonically-related counters describe the set:
//!
//! - `n_max`: compile-time hard cap
//! - `n_created`: workers ever instantiated, monotone nondecreasing
//! - `n_running`: currently running or draining
//! - `n_desired`: currently accepting new work
//!
//! Invariant: `1 <= n_desired <= n_running <= n_created <= n_max`.
//! Workers are referenced by stable zero-based index; a slot, once
//! created, is never reused. A worker thread never exits before process
//! shutdown - "removed" simply means deactivated.

use super::rebalance::{plan_rebalance, RebalancePlan};
use super::worker::{RoutingWorker, WorkerHandle, WorkerState, WorkerTask};
use crate::Error;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Hard cap on routing workers.
pub const N_MAX: usize = 256;

/// The set of routing workers.
pub struct Workers {
    handles: RwLock<Vec<Arc<WorkerHandle>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,

    n_created: Arc<AtomicUsize>,
    n_running: AtomicUsize,
    n_desired: AtomicUsize,

    /// Round-robin cursor for new-session placement.
    rr_next: AtomicUsize,
    rebalance_window: usize,
}

impl Workers {
    /// Create and start `n_threads` routing workers.
    pub fn new(n_threads: usize, rebalance_window: usize) -> Result<Self, Error> {
        if n_threads == 0 || n_threads > N_MAX {
            return Err(Error::InvalidThreadCount(n_threads));
        }
        let workers = Self {
            handles: RwLock::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            n_created: Arc::new(AtomicUsize::new(0)),
            n_running: AtomicUsize::new(0),
            n_desired: AtomicUsize::new(0),
            rr_next: AtomicUsize::new(0),
            rebalance_window,
        };
        workers.create_workers(n_threads).map_err(Error::Io)?;
        workers.n_desired.store(n_threads, Ordering::Release);
        Ok(workers)
    }

    fn create_workers(&self, count: usize) -> io::Result<()> {
        let mut handles = self.handles.write();
        let mut threads = self.threads.lock();
        for _ in 0..count {
            let index = handles.len();
            let (mut worker, handle) =
                RoutingWorker::create_in_set(index, self.rebalance_window, Arc::clone(&self.n_created))?;
            let thread = std::thread::Builder::new()
                .name(format!("worker-{index:02}"))
                .spawn(move || worker.run())?;
            handles.push(handle);
            threads.push(thread);
            self.n_created.fetch_add(1, Ordering::AcqRel);
            self.n_running.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------

    pub fn n_created(&self) -> usize {
        self.n_created.load(Ordering::Acquire)
    }

    pub fn n_running(&self) -> usize {
        self.n_running.load(Ordering::Acquire)
    }

    pub fn n_desired(&self) -> usize {
        self.n_desired.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------

    pub fn handle(&self, index: usize) -> Option<Arc<WorkerHandle>> {
        self.handles.read().get(index).cloned()
    }

    pub fn handles(&self) -> Vec<Arc<WorkerHandle>> {
        self.handles.read().clone()
    }

    /// Pick a worker for a new client connection: round-robin over the
    /// desired (listening) worker set.
    pub fn pick_worker(&self) -> Option<Arc<WorkerHandle>> {
        let desired = self.n_desired();
        if desired == 0 {
            return None;
        }
        let handles = self.handles.read();
        for _ in 0..desired {
            let index = self.rr_next.fetch_add(1, Ordering::Relaxed) % desired;
            if let Some(handle) = handles.get(index) {
                if handle.is_active() && handle.is_listening() {
                    return Some(Arc::clone(handle));
                }
            }
        }
        handles.get(0).cloned()
    }

    /// Post a task to every running worker.
    pub fn broadcast(&self, make_task: impl Fn() -> WorkerTask) -> usize {
        let handles = self.handles.read();
        let running = self.n_running();
        let mut posted = 0;
        for handle in handles.iter().take(running) {
            if handle.execute_queued(make_task()) {
                posted += 1;
            }
        }
        posted
    }

    // ------------------------------------------------------------------
    // Dynamic thread count
    // ------------------------------------------------------------------

    /// Reconfigure to `count` workers. Only the main worker initiates
    /// this.
    pub fn adjust_threads(&self, count: usize) -> Result<(), Error> {
        if count == 0 || count > N_MAX {
            return Err(Error::InvalidThreadCount(count));
        }
        let desired = self.n_desired();
        match count.cmp(&desired) {
            std::cmp::Ordering::Greater => self.increase_threads(count - desired),
            std::cmp::Ordering::Less => {
                self.decrease_threads(desired - count);
                Ok(())
            }
            std::cmp::Ordering::Equal => Ok(()),
        }
    }

    /// Activate inactive slots first, then create new workers up to the
    /// cap.
    fn increase_threads(&self, delta: usize) -> Result<(), Error> {
        let mut remaining = delta;

        {
            let handles = self.handles.read();
            for handle in handles.iter() {
                if remaining == 0 {
                    break;
                }
                if handle.state() == WorkerState::Inactive {
                    handle.set_state(WorkerState::Active);
                    handle.set_listening(true);
                    let min_running = handle.index() + 1;
                    self.n_running.fetch_max(min_running, Ordering::AcqRel);
                    remaining -= 1;
                    log::info!("[WORKERS] reactivated worker {}", handle.index());
                }
            }
        }

        if remaining > 0 {
            if self.n_created() + remaining > N_MAX {
                return Err(Error::InvalidThreadCount(self.n_created() + remaining));
            }
            self.create_workers(remaining).map_err(Error::Io)?;
        }

        self.n_desired.fetch_add(delta, Ordering::AcqRel);
        Ok(())
    }

    /// Tell the highest-indexed active workers to stop listening; they
    /// drain and deactivate themselves once their session sets empty.
    /// `n_desired` drops immediately, `n_running` only when the topmost
    /// contiguous run of workers has become inactive.
    fn decrease_threads(&self, delta: usize) {
        let desired = self.n_desired();
        debug_assert!(delta < desired, "at least one worker must remain");

        let handles = self.handles.read();
        let mut remaining = delta;
        for handle in handles.iter().rev() {
            if remaining == 0 {
                break;
            }
            if handle.state() == WorkerState::Active {
                handle.set_state(WorkerState::Draining);
                handle.set_listening(false);
                remaining -= 1;
                log::info!("[WORKERS] worker {} is draining", handle.index());
            }
        }

        self.n_desired.fetch_sub(delta, Ordering::AcqRel);
    }

    /// Recompute `n_running` from the topmost contiguous run of inactive
    /// workers. Called periodically by the main worker.
    pub fn update_running(&self) {
        let handles = self.handles.read();
        let mut running = self.n_running();
        while running > self.n_desired() {
            match handles.get(running - 1) {
                Some(handle) if handle.state() == WorkerState::Inactive => running -= 1,
                _ => break,
            }
        }
        self.n_running.store(running, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Load balancing
    // ------------------------------------------------------------------

    /// Sample every worker's one-second load into its rolling average.
    pub fn sample_loads(&self) {
        for handle in self.handles.read().iter() {
            handle.sample_load();
        }
    }

    /// Inspect per-worker load and, when the spread exceeds `threshold`,
    /// ask the hottest worker to move sessions to the coldest. The move
    /// is performed from the source worker's own loop.
    pub fn balance_workers(&self, threshold: u32, use_average: bool) -> Option<RebalancePlan> {
        let handles = self.handles.read();
        let running = self.n_running();

        let loads: Vec<(usize, u32)> = handles
            .iter()
            .take(running)
            .map(|handle| {
                let load = if use_average {
                    handle.average_load()
                } else {
                    handle.load()
                };
                (handle.index(), load)
            })
            .collect();

        let plan = plan_rebalance(&loads, threshold)?;
        let to = Arc::clone(handles.get(plan.to)?);
        let from = handles.get(plan.from)?;
        let n_sessions = plan.n_sessions;
        from.execute_queued(Box::new(move |worker| {
            worker.note_rebalance(to, n_sessions);
        }));
        Some(plan)
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Broadcast shutdown and join every worker thread.
    pub fn shutdown(&self) {
        for handle in self.handles.read().iter() {
            handle.request_shutdown();
        }
        let mut threads = self.threads.lock();
        for thread in threads.drain(..) {
            if let Err(error) = thread.join() {
                log::error!("[WORKERS] worker thread panicked: {error:?}");
            }
        }
    }

    /// Every worker has exited its loop.
    pub fn shutdown_complete(&self) -> bool {
        self.threads.lock().is_empty()
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.shutdown();
    }
}
