// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker liveness notification.
//!
//! Each worker pokes its notifier once per loop iteration; a supervisor
//! can then distinguish a busy worker from a hung one. Handlers must not
//! block, but some operations (notably `getaddrinfo`) are performed
//! inline; those are wrapped in a [`DeliberatelyBlocking`] guard so the
//! liveness check does not trip.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-worker liveness state shared with the supervisor.
#[derive(Debug, Default)]
pub struct WatchdogNotifier {
    /// Incremented by the worker each loop iteration.
    ticks: AtomicU64,
    /// Depth of deliberately-blocking sections; non-zero suspends the
    /// staleness judgement.
    blocking_depth: AtomicUsize,
}

impl WatchdogNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Called by the owning worker once per event-loop iteration.
    #[inline]
    pub fn notify(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Enter a section that is allowed to block, e.g. a `getaddrinfo`
    /// call. The returned guard pokes the notifier on entry and exit.
    pub fn workaround(self: &Arc<Self>) -> DeliberatelyBlocking {
        self.notify();
        self.blocking_depth.fetch_add(1, Ordering::Release);
        DeliberatelyBlocking {
            notifier: Arc::clone(self),
        }
    }

    pub fn is_deliberately_blocking(&self) -> bool {
        self.blocking_depth.load(Ordering::Acquire) > 0
    }
}

/// RAII guard for a blocking section.
pub struct DeliberatelyBlocking {
    notifier: Arc<WatchdogNotifier>,
}

impl Drop for DeliberatelyBlocking {
    fn drop(&mut self) {
        self.notifier.blocking_depth.fetch_sub(1, Ordering::Release);
        self.notifier.notify();
    }
}

/// Supervisor-side view of one worker's liveness.
#[derive(Debug)]
pub struct LivenessProbe {
    notifier: Arc<WatchdogNotifier>,
    last_ticks: u64,
    last_progress: Instant,
}

impl LivenessProbe {
    pub fn new(notifier: Arc<WatchdogNotifier>) -> Self {
        let last_ticks = notifier.ticks();
        Self {
            notifier,
            last_ticks,
            last_progress: Instant::now(),
        }
    }

    /// True when the worker has made progress since the last probe, is in
    /// a deliberately-blocking section, or the grace period has not yet
    /// elapsed.
    pub fn check(&mut self, grace: Duration) -> bool {
        let ticks = self.notifier.ticks();
        if ticks != self.last_ticks {
            self.last_ticks = ticks;
            self.last_progress = Instant::now();
            return true;
        }
        self.notifier.is_deliberately_blocking() || self.last_progress.elapsed() < grace
    }
}
