// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Copy-on-write shared-state propagator.
//!
//! Workers read lock-free snapshots of configuration-like data while a
//! single updater thread applies a totally-ordered stream of updates:
//! new versions are cloned, updated and published atomically, and old
//! versions are garbage-collected once no reader references them.

pub mod data;
pub mod updater;
mod wake;

pub use data::{Envelope, SharedData};
pub use updater::{GcUpdater, UpdaterConfig, UpdaterLogic};
pub use wake::WakeNotifier;
