// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-producer handle of a shared-state propagator.
//!
//! A `SharedData<T, U>` pairs a bounded update ring (producer to updater)
//! with two snapshot slots (updater to reader). Readers hold a possibly
//! stale snapshot for the duration of one interaction; writers never see
//! a torn mix of two versions.

use super::wake::WakeNotifier;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// An update stamped with its creation order.
///
/// Timestamps are drawn from one process-global counter shared by every
/// producer of the same propagator, so consecutive stamps form a totally
/// ordered update stream.
#[derive(Debug, Clone)]
pub struct Envelope<U> {
    pub tstamp: u64,
    pub update: U,
}

/// Snapshot slots of one reader: `current` is what the reader last
/// acquired, `pending` is what the updater last published. Both count as
/// in-use for garbage collection.
struct Slots<T> {
    current: Arc<T>,
    pending: Arc<T>,
}

/// One producer/reader endpoint of a propagator.
///
/// Owned by the updater; workers hold an `Arc` to their own instance.
pub struct SharedData<T, U> {
    ring: ArrayQueue<Envelope<U>>,
    slots: Mutex<Slots<T>>,

    /// Signalled by producers when updates are queued, and on shutdown.
    updater_wake: Arc<WakeNotifier>,
    /// Signalled by the updater after draining this ring, releasing a
    /// producer blocked on a full ring.
    drained: WakeNotifier,

    tstamp_gen: Arc<AtomicU64>,
}

impl<T, U> SharedData<T, U> {
    pub(super) fn new(
        initial: Arc<T>,
        queue_max: usize,
        updater_wake: Arc<WakeNotifier>,
        tstamp_gen: Arc<AtomicU64>,
    ) -> Self {
        Self {
            ring: ArrayQueue::new(queue_max),
            slots: Mutex::new(Slots {
                current: Arc::clone(&initial),
                pending: initial,
            }),
            updater_wake,
            drained: WakeNotifier::new(),
            tstamp_gen,
        }
    }

    /// Queue an update for the updater thread.
    ///
    /// Non-blocking while the ring has space; a full ring blocks the
    /// producer until the updater drains it. A ring-full event should be
    /// rare; if the updater thread has died this never returns, which is
    /// the designed failure mode.
    pub fn send(&self, update: U) {
        let tstamp = self.tstamp_gen.fetch_add(1, Ordering::Relaxed);
        self.send_envelope(Envelope { tstamp, update });
    }

    /// Queue an update with a caller-provided timestamp. Only meaningful
    /// for tests that need a deterministic interleaving; normal code uses
    /// [`SharedData::send`].
    #[doc(hidden)]
    pub fn send_stamped(&self, tstamp: u64, update: U) {
        self.send_envelope(Envelope { tstamp, update });
    }

    fn send_envelope(&self, mut env: Envelope<U>) {
        loop {
            match self.ring.push(env) {
                Ok(()) => {
                    self.updater_wake.notify();
                    return;
                }
                Err(back) => {
                    env = back;
                    self.updater_wake.notify();
                    self.drained.wait_timeout(Duration::from_millis(10));
                }
            }
        }
    }

    /// Acquire the current snapshot.
    ///
    /// The returned pointer is valid only until the reader yields back to
    /// its event loop; re-acquire on every interaction.
    pub fn snapshot(&self) -> Arc<T> {
        let mut slots = self.slots.lock();
        slots.current = Arc::clone(&slots.pending);
        Arc::clone(&slots.current)
    }

    /// Publish a new version to this reader. Updater-side.
    pub(super) fn set_new_data(&self, data: Arc<T>) {
        self.slots.lock().pending = data;
    }

    /// Drop snapshot references so the final garbage collection can run.
    /// Updater-side, at shutdown.
    pub(super) fn reset_slots(&self, initial: Arc<T>) {
        let mut slots = self.slots.lock();
        slots.current = Arc::clone(&initial);
        slots.pending = initial;
    }

    /// Move queued envelopes into `out` and signal any producer blocked
    /// on a full ring. At most one ring's worth is taken per call, so the
    /// updater's working set stays bounded even while producers keep
    /// pushing; the rest is picked up next tick. Updater-side.
    pub(super) fn drain_into(&self, out: &mut Vec<Envelope<U>>) {
        let mut drained = 0;
        while drained < self.ring.capacity() {
            match self.ring.pop() {
                Some(env) => {
                    out.push(env);
                    drained += 1;
                }
                None => break,
            }
        }
        if drained > 0 {
            self.drained.notify();
        }
    }

    /// Updates are queued and not yet drained by the updater.
    pub fn has_data(&self) -> bool {
        !self.ring.is_empty()
    }

    /// Block until updates are queued, a notification arrives, or the
    /// timeout elapses. Skipped entirely while `no_blocking` is set.
    pub(super) fn wait_for_updates(&self, timeout: Duration, no_blocking: &AtomicBool) -> bool {
        if no_blocking.load(Ordering::Acquire) {
            return self.has_data();
        }
        if self.has_data() {
            return true;
        }
        self.updater_wake.wait_timeout(timeout)
    }

    /// Wake the updater without queueing data, e.g. at shutdown.
    pub(super) fn interrupt(&self) {
        self.updater_wake.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sd(queue_max: usize) -> SharedData<u32, u32> {
        SharedData::new(
            Arc::new(7u32),
            queue_max,
            Arc::new(WakeNotifier::new()),
            Arc::new(AtomicU64::new(0)),
        )
    }

    #[test]
    fn test_snapshot_tracks_published_data() {
        let sd = make_sd(4);
        assert_eq!(*sd.snapshot(), 7);

        sd.set_new_data(Arc::new(8));
        assert_eq!(*sd.snapshot(), 8);
    }

    #[test]
    fn test_send_stamps_monotonically() {
        let sd = make_sd(8);
        sd.send(10);
        sd.send(20);
        sd.send(30);

        let mut out = Vec::new();
        sd.drain_into(&mut out);
        let stamps: Vec<u64> = out.iter().map(|e| e.tstamp).collect();
        assert_eq!(stamps, vec![0, 1, 2]);
    }

    #[test]
    fn test_full_ring_blocks_until_drained() {
        let sd = Arc::new(make_sd(2));
        sd.send(1);
        sd.send(2);

        let producer = {
            let sd = Arc::clone(&sd);
            std::thread::spawn(move || {
                // Blocks until the ring is drained below capacity.
                sd.send(3);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        let mut out = Vec::new();
        sd.drain_into(&mut out);
        producer.join().unwrap();

        sd.drain_into(&mut out);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_snapshot_never_torn() {
        // A reader observes either the old or the new version, and the
        // old snapshot stays valid while held.
        let sd = make_sd(4);
        let old = sd.snapshot();
        sd.set_new_data(Arc::new(9));
        assert_eq!(*old, 7, "held snapshot must stay valid");
        assert_eq!(*sd.snapshot(), 9);
    }
}
