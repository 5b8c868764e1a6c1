// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wake notification with atomic fast-path.
//!
//! Used between update producers and the propagator updater thread:
//! - Atomic flag for lock-free notification (hot traffic)
//! - Condvar fallback for blocking wait (sporadic traffic)

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Two-tier wake notification.
///
/// `notify()` is an atomic store on the hot path; the condvar is only
/// signalled when a waiter might be sleeping.
#[derive(Debug, Default)]
pub struct WakeNotifier {
    /// Atomic flag for the lock-free fast-path
    data_ready: AtomicBool,
    /// Mutex for the condvar (only used when sleeping)
    sleeping: Mutex<bool>,
    /// Condvar for efficient waiting when idle
    condvar: Condvar,
}

impl WakeNotifier {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notify that data is available.
    ///
    /// The sleeping check is racy but safe; the worst case is an extra
    /// signal.
    #[inline]
    pub fn notify(&self) {
        self.data_ready.store(true, Ordering::Release);

        if *self.sleeping.lock() {
            self.condvar.notify_all();
        }
    }

    /// Check if data is ready and clear the flag.
    #[inline]
    pub fn check_and_clear(&self) -> bool {
        self.data_ready.swap(false, Ordering::Acquire)
    }

    /// Wait for a notification with timeout. Returns immediately if the
    /// flag is already set. Returns `true` when notified, `false` on
    /// timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.data_ready.swap(false, Ordering::Acquire) {
            return true;
        }

        let mut sleeping = self.sleeping.lock();

        // Double-check after acquiring the lock
        if self.data_ready.swap(false, Ordering::Acquire) {
            return true;
        }

        *sleeping = true;
        let result = self.condvar.wait_for(&mut sleeping, timeout);
        *sleeping = false;

        if self.data_ready.swap(false, Ordering::Acquire) {
            !result.timed_out()
        } else {
            false
        }
    }
}
