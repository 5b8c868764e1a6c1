// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The main worker: the singleton control-plane thread.
//!
//! Runs housekeeping tasks on a timer queue, maintains the cheap global
//! tick counter, drives rebalancing, and is the sole initiator of dynamic
//! thread-count reconfiguration. Routing work never runs here.

use super::workers::Workers;
use crate::Error;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Global clock, incremented every 100 ms while a main worker runs.
/// Routing workers use it for cheap time checks.
static CLOCK_TICKS: AtomicI64 = AtomicI64::new(0);

/// Current tick count. One tick is 100 ms.
pub fn ticks() -> i64 {
    CLOCK_TICKS.load(Ordering::Relaxed)
}

/// A registered housekeeping task. Returning `false` deregisters it.
pub type TaskFn = Box<dyn FnMut() -> bool + Send>;

struct TaskEntry {
    func: TaskFn,
    every: Duration,
    next: Instant,
}

/// Main worker tuning.
#[derive(Debug, Clone, Copy)]
pub struct MainWorkerConfig {
    /// Cadence of average-load sampling; zero selects one-second loads
    /// for rebalancing decisions.
    pub rebalance_period: Duration,
    /// Load-spread threshold in percentage points; zero disables
    /// rebalancing.
    pub rebalance_threshold: u32,
}

impl Default for MainWorkerConfig {
    fn default() -> Self {
        Self {
            rebalance_period: Duration::ZERO,
            rebalance_threshold: 0,
        }
    }
}

struct Shared {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    running: AtomicBool,
    config: Mutex<MainWorkerConfig>,
}

/// The control-plane thread.
pub struct MainWorker {
    shared: Arc<Shared>,
    workers: Arc<Workers>,
    thread: Option<JoinHandle<()>>,
}

impl MainWorker {
    pub fn new(workers: Arc<Workers>, config: MainWorkerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                tasks: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                config: Mutex::new(config),
            }),
            workers,
            thread: None,
        }
    }

    /// Start the control thread. Idempotent at its boundary.
    pub fn start(&mut self) {
        if self.thread.is_some() {
            return;
        }
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let workers = Arc::clone(&self.workers);
        self.thread = Some(
            std::thread::Builder::new()
                .name("main-worker".into())
                .spawn(move || run(shared, workers))
                .expect("spawning the main worker thread"),
        );
    }

    /// Stop the control thread. Idempotent at its boundary.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Register a named housekeeping task. Names are unique; the task
    /// runs every `frequency` until it returns `false` or is removed.
    pub fn add_task(&self, name: impl Into<String>, func: TaskFn, frequency: Duration) -> bool {
        let name = name.into();
        let mut tasks = self.shared.tasks.lock();
        if tasks.contains_key(&name) {
            log::warn!("[MAINWORKER] task '{name}' is already registered");
            return false;
        }
        tasks.insert(
            name,
            TaskEntry {
                func,
                every: frequency,
                next: Instant::now() + frequency,
            },
        );
        true
    }

    pub fn remove_task(&self, name: &str) -> bool {
        self.shared.tasks.lock().remove(name).is_some()
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.shared.tasks.lock().contains_key(name)
    }

    pub fn set_config(&self, config: MainWorkerConfig) {
        *self.shared.config.lock() = config;
    }

    /// Reconfigure the routing thread count. The main worker is the sole
    /// initiator of this operation.
    pub fn adjust_threads(&self, count: usize) -> Result<(), Error> {
        self.workers.adjust_threads(count)
    }
}

impl Drop for MainWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>, workers: Arc<Workers>) {
    let tick = Duration::from_millis(100);
    let mut last_balance = Instant::now();
    let mut last_sample = Instant::now();

    while shared.running.load(Ordering::Acquire) {
        std::thread::sleep(tick);
        CLOCK_TICKS.fetch_add(1, Ordering::Relaxed);

        // Run due housekeeping tasks; a task returning false
        // deregisters itself.
        let now = Instant::now();
        {
            let mut tasks = shared.tasks.lock();
            let mut dead = Vec::new();
            for (name, entry) in tasks.iter_mut() {
                if entry.next <= now {
                    entry.next = now + entry.every;
                    if !(entry.func)() {
                        dead.push(name.clone());
                    }
                }
            }
            for name in dead {
                tasks.remove(&name);
            }
        }

        let config = *shared.config.lock();

        if !config.rebalance_period.is_zero()
            && now.duration_since(last_sample) >= config.rebalance_period
        {
            last_sample = now;
            workers.sample_loads();
        }

        if now.duration_since(last_balance) >= Duration::from_secs(1) {
            last_balance = now;
            workers.update_running();
            if config.rebalance_threshold != 0 {
                let use_average = !config.rebalance_period.is_zero();
                workers.balance_workers(config.rebalance_threshold, use_average);
            }
        }
    }
}
