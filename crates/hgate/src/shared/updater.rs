// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Garbage-collecting updater: the single thread applying a totally
//! ordered update stream to copy-on-write shared state.
//!
//! # Architecture
//!
//! ```text
//! +----------+  ring   +-----------------------------+
//! | producer | ------> |           updater           |
//! +----------+         |  drain -> sort -> walk      |
//! +----------+  ring   |  clone -> apply -> publish  |
//! | producer | ------> |  gc unreferenced copies     |
//! +----------+         +-----------------------------+
//!      ^                         |
//!      +------- snapshots -------+
//! ```
//!
//! # Ordering
//!
//! All producers of one propagator stamp updates from a single shared
//! counter, so there is an unbroken integer sequence of updates ordered by
//! creation time. Each tick the updater drains every ring; a drain can
//! observe a gap (a stamped update not yet pushed), but the missing update
//! is already stamped and will arrive by the next tick. The updater sorts
//! what it has, applies the prefix with consecutive timestamps, and carries
//! the rest over. A consequence: the working set after a drain is always
//! smaller than `2 * clients * queue_max` envelopes.

use super::data::{Envelope, SharedData};
use super::wake::WakeNotifier;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the updater naps while waiting for garbage or updates.
const GARBAGE_WAIT: Duration = Duration::from_micros(100);

/// Bounded wait between idle ticks; notifications cut it short.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// The domain logic of an updater: how to clone the data for
/// copy-on-write, and how to apply a batch of updates.
pub trait UpdaterLogic<T, U>: Send {
    /// Clone the current version for copy-on-write publication.
    ///
    /// Updates-only updaters never publish and may leave the default,
    /// which panics if reached.
    fn create_new_copy(&self, _current: &T) -> T {
        panic!("create_new_copy called on an updates-only updater");
    }

    /// Apply a totally-ordered batch. Never called with an empty batch.
    fn make_updates(&mut self, data: &mut T, batch: &[Envelope<U>]);
}

/// Updater tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct UpdaterConfig {
    /// Capacity of each producer ring.
    pub queue_max: usize,
    /// Maximum number of simultaneously live copies; 0 means unlimited.
    /// A cap of 1 is impossible because the latest copy is always live.
    pub cap_copies: usize,
    /// Process updates in creation order. Turning this off trades the
    /// total-order guarantee for latency.
    pub order_updates: bool,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            queue_max: 1024,
            cap_copies: 0,
            order_updates: true,
        }
    }
}

/// Shared bookkeeping between the updater thread and its owner.
struct Core<T, U> {
    clients: Mutex<Vec<Arc<SharedData<T, U>>>>,
    /// Pairs with `clients`: the updater parks here during a client
    /// count change.
    client_cond: Condvar,
    pending_client_change: AtomicBool,
    no_blocking: AtomicBool,
    running: AtomicBool,

    updater_wake: Arc<WakeNotifier>,
    tstamp_gen: Arc<AtomicU64>,
    latest: Mutex<Arc<T>>,

    config: UpdaterConfig,
    updates_only: bool,
}

impl<T, U> Core<T, U> {
    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn latest(&self) -> Arc<T> {
        Arc::clone(&self.latest.lock())
    }
}

/// The garbage-collecting updater.
///
/// Owns the producer endpoints ([`SharedData`]) and the updater thread.
/// Old versions are collected once no reader slot references them; the
/// latest version is always kept.
pub struct GcUpdater<T, U, L> {
    core: Arc<Core<T, U>>,
    logic: Option<L>,
    accumulator: Option<T>,
    thread: Option<JoinHandle<(L, Option<T>)>>,
}

impl<T, U, L> GcUpdater<T, U, L>
where
    T: Send + Sync + 'static,
    U: Send + 'static,
    L: UpdaterLogic<T, U> + 'static,
{
    /// Create a publishing updater with `num_clients` producer endpoints.
    ///
    /// Pass `num_clients == 0` when producers are added dynamically with
    /// [`GcUpdater::increase_client_count`].
    pub fn new(initial: T, num_clients: usize, logic: L, config: UpdaterConfig) -> Self {
        assert_ne!(config.cap_copies, 1, "cap of one live copy is impossible");
        Self::build(initial, num_clients, logic, config, None)
    }

    /// Create an updates-only updater: no cloning, no publication, no
    /// garbage collection. Updates accumulate into `accumulator`, which
    /// [`GcUpdater::stop`] hands back; readers keep seeing `snapshot`.
    /// This mode fits sinks such as a log or metric collector.
    pub fn new_updates_only(
        snapshot: T,
        accumulator: T,
        num_clients: usize,
        logic: L,
        config: UpdaterConfig,
    ) -> Self {
        Self::build(snapshot, num_clients, logic, config, Some(accumulator))
    }

    fn build(
        initial: T,
        num_clients: usize,
        logic: L,
        config: UpdaterConfig,
        accumulator: Option<T>,
    ) -> Self {
        let updates_only = accumulator.is_some();
        let initial = Arc::new(initial);
        let updater_wake = Arc::new(WakeNotifier::new());
        let tstamp_gen = Arc::new(AtomicU64::new(0));

        let clients = (0..num_clients)
            .map(|_| {
                Arc::new(SharedData::new(
                    Arc::clone(&initial),
                    config.queue_max,
                    Arc::clone(&updater_wake),
                    Arc::clone(&tstamp_gen),
                ))
            })
            .collect();

        Self {
            core: Arc::new(Core {
                clients: Mutex::new(clients),
                client_cond: Condvar::new(),
                pending_client_change: AtomicBool::new(false),
                no_blocking: AtomicBool::new(false),
                running: AtomicBool::new(false),
                updater_wake,
                tstamp_gen,
                latest: Mutex::new(initial),
                config,
                updates_only,
            }),
            logic: Some(logic),
            accumulator,
            thread: None,
        }
    }

    /// Start the updater thread. Idempotent at its boundary: starting a
    /// started updater is a no-op.
    pub fn start(&mut self) {
        if self.thread.is_some() {
            return;
        }
        let Some(logic) = self.logic.take() else {
            return;
        };
        self.core.running.store(true, Ordering::Release);
        let core = Arc::clone(&self.core);
        let accumulator = self.accumulator.take();
        self.thread = Some(
            thread::Builder::new()
                .name("gcupdater".into())
                .spawn(move || run(core, logic, accumulator))
                .expect("spawning the updater thread"),
        );
    }

    /// Stop the updater thread and get back the logic and, for an
    /// updates-only updater, the accumulator.
    pub fn stop(&mut self) -> Option<(L, Option<T>)> {
        self.core.running.store(false, Ordering::Release);
        self.core.updater_wake.notify();
        self.core.client_cond.notify_all();

        let thread = self.thread.take()?;
        let result = thread.join().expect("updater thread panicked");
        Some(result)
    }

    /// Producer endpoint by worker index.
    pub fn shared_data(&self, index: usize) -> Arc<SharedData<T, U>> {
        Arc::clone(&self.core.clients.lock()[index])
    }

    /// All producer endpoints, ordered by worker index.
    pub fn shared_data_handles(&self) -> Vec<Arc<SharedData<T, U>>> {
        self.core.clients.lock().clone()
    }

    /// The latest published version. The data may be superseded at any
    /// time; intended for tests and introspection.
    pub fn latest(&self) -> Arc<T> {
        self.core.latest()
    }

    /// Add a producer endpoint at `index`, which must equal the current
    /// count. The updater is briefly switched to non-blocking mode while
    /// the change is applied under the client mutex.
    pub fn increase_client_count(&self, index: usize) -> Arc<SharedData<T, U>> {
        let core = &self.core;
        core.pending_client_change.store(true, Ordering::Release);
        core.no_blocking.store(true, Ordering::Release);
        core.updater_wake.notify();

        let mut clients = core.clients.lock();
        assert_eq!(index, clients.len(), "client indices are contiguous");
        let sd = Arc::new(SharedData::new(
            core.latest(),
            core.config.queue_max,
            Arc::clone(&core.updater_wake),
            Arc::clone(&core.tstamp_gen),
        ));
        clients.push(Arc::clone(&sd));

        core.pending_client_change.store(false, Ordering::Release);
        core.no_blocking.store(false, Ordering::Release);
        drop(clients);
        core.client_cond.notify_all();
        sd
    }

    /// Drop the highest-indexed producer endpoint, which must be `index`.
    /// Waits for the endpoint's ring to drain first so no stamped update
    /// is lost from the total order.
    pub fn decrease_client_count(&self, index: usize) {
        let core = &self.core;
        core.pending_client_change.store(true, Ordering::Release);
        core.no_blocking.store(true, Ordering::Release);
        core.updater_wake.notify();

        let mut clients = core.clients.lock();
        assert_eq!(index + 1, clients.len(), "only the last client can go");

        while clients.last().is_some_and(|sd| sd.has_data()) {
            core.pending_client_change.store(false, Ordering::Release);
            drop(clients);
            core.client_cond.notify_all();
            thread::sleep(Duration::from_millis(1));
            core.pending_client_change.store(true, Ordering::Release);
            clients = core.clients.lock();
        }

        clients.pop();
        let now_empty = clients.is_empty();

        core.pending_client_change.store(false, Ordering::Release);
        core.no_blocking.store(false, Ordering::Release);
        if now_empty {
            core.running.store(false, Ordering::Release);
        }
        drop(clients);
        core.client_cond.notify_all();
    }
}

impl<T, U, L> Drop for GcUpdater<T, U, L> {
    fn drop(&mut self) {
        self.core.running.store(false, Ordering::Release);
        self.core.updater_wake.notify();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Retain copies that are still referenced from outside `all_ptrs`; the
/// return value is the number of collectable copies (everything except the
/// latest, which is always live through the core).
fn gc<T>(all_ptrs: &mut Vec<Arc<T>>) -> usize {
    all_ptrs.retain(|ptr| Arc::strong_count(ptr) > 1);
    all_ptrs.len().saturating_sub(1)
}

fn run<T, U, L>(core: Arc<Core<T, U>>, mut logic: L, mut accumulator: Option<T>) -> (L, Option<T>)
where
    T: Send + Sync,
    L: UpdaterLogic<T, U>,
{
    let mut local_queue: Vec<Envelope<U>> = Vec::new();
    let mut leftover: Vec<Envelope<U>> = Vec::new();
    let mut expected_tstamp: u64 = 0;
    let mut all_ptrs: Vec<Arc<T>> = vec![core.latest()];
    let mut gc_count = 0usize;

    // The producer threads may not have been attached yet.
    while core.running() && core.clients.lock().is_empty() {
        thread::sleep(GARBAGE_WAIT);
    }

    'tick: while core.running() {
        {
            let mut guard = core.clients.lock();
            while core.pending_client_change.load(Ordering::Acquire) && core.running() {
                core.client_cond.wait(&mut guard);
            }
        }
        let clients: Vec<Arc<SharedData<T, U>>> = core.clients.lock().clone();
        if clients.is_empty() {
            break;
        }

        local_queue.clear();
        if core.config.order_updates {
            std::mem::swap(&mut local_queue, &mut leftover);
        }

        for client in &clients {
            client.drain_into(&mut local_queue);
        }

        debug_assert!(local_queue.len() <= 2 * clients.len() * core.config.queue_max);

        if local_queue.is_empty() {
            if gc_count > 0 {
                gc_count = gc(&mut all_ptrs);
            }

            let mut have_data = false;
            // Wait for updates, or a timeout to check for new garbage
            // (opportunistic gc).
            let mut rounds = 5;
            while gc_count > 0 && rounds > 0 && !have_data {
                have_data = clients[0].wait_for_updates(GARBAGE_WAIT, &core.no_blocking);
                if !have_data {
                    gc_count = gc(&mut all_ptrs);
                }
                rounds -= 1;
            }

            if !have_data && core.running() {
                clients[0].wait_for_updates(IDLE_WAIT, &core.no_blocking);
            }

            for client in &clients {
                client.drain_into(&mut local_queue);
            }

            if local_queue.is_empty() {
                // Shutting down, or the non-blocking drain already
                // consumed the events behind the notification.
                continue 'tick;
            }
        }

        if core.config.order_updates {
            local_queue.sort_by_key(|env| env.tstamp);

            // Find the discontinuity point (missing timestamp) and carry
            // everything after it to the next tick.
            let mut ind = 0;
            while ind < local_queue.len() && local_queue[ind].tstamp == expected_tstamp {
                expected_tstamp += 1;
                ind += 1;
            }
            if ind < local_queue.len() {
                leftover.extend(local_queue.drain(ind..));
            }

            if local_queue.is_empty() {
                // Never call make_updates with an empty batch.
                continue 'tick;
            }
        }

        // Honor the cap on simultaneously live copies: wait for readers
        // to release versions. Should be over very quickly.
        while core.config.cap_copies > 0
            && gc_count >= core.config.cap_copies
            && core.running()
        {
            let before = gc_count;
            gc_count = gc(&mut all_ptrs);
            if gc_count == before {
                thread::sleep(GARBAGE_WAIT);
            }
        }

        if core.updates_only {
            if let Some(acc) = accumulator.as_mut() {
                logic.make_updates(acc, &local_queue);
            }
        } else {
            let mut next = logic.create_new_copy(&core.latest());
            logic.make_updates(&mut next, &local_queue);
            let next = Arc::new(next);

            all_ptrs.push(Arc::clone(&next));
            gc_count += 1;
            *core.latest.lock() = Arc::clone(&next);
            for client in &clients {
                client.set_new_data(Arc::clone(&next));
            }

            if gc_count > 1 {
                gc_count = gc(&mut all_ptrs);
            }
        }
    }

    // Workers are stopped; release their snapshot slots so the final
    // collection only keeps the latest version.
    let latest = core.latest();
    for client in core.clients.lock().iter() {
        client.reset_slots(Arc::clone(&latest));
    }
    gc(&mut all_ptrs);

    (logic, accumulator)
}
