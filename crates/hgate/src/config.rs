// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global configuration - single source of truth.
//!
//! Compile-time constants, the runtime-adjustable configuration, and the
//! minimal INI grammar the core understands. The configuration subsystem
//! producing the files is external; the core only consumes `[section]`
//! and `key=value` lines.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

// =======================================================================
// Compile-time constants
// =======================================================================

/// Hard cap on routing workers. **NEVER hardcode elsewhere!**
pub const MAX_THREADS: usize = crate::engine::N_MAX;

/// Default routing worker count before configuration is read.
pub const DEFAULT_THREADS: usize = 1;

/// Default bound of a propagator producer ring.
pub const DEFAULT_QUEUE_MAX: usize = 1024;

/// Cadence of the pooled-connection expiry sweep.
pub const POOL_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Default multiplex timeout: how long an endpoint may wait for a
/// connection slot before the session fails.
pub const DEFAULT_MULTIPLEX_TIMEOUT: Duration = Duration::from_secs(60);

// =======================================================================
// Runtime configuration
// =======================================================================

/// Runtime-adjustable knobs of the routing core.
///
/// Readers take a cheap atomic snapshot; the admin boundary replaces the
/// whole value on change, so a reader never observes a torn mix.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub threads: usize,
    /// Load-spread percentage that triggers a rebalance; zero disables.
    pub rebalance_threshold: u32,
    /// Cadence of average-load sampling; zero selects one-second loads.
    pub rebalance_period: Duration,
    /// Number of samples in the rolling load average.
    pub rebalance_window: usize,
    pub queue_max: usize,
    pub multiplex_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            rebalance_threshold: 0,
            rebalance_period: Duration::ZERO,
            rebalance_window: 10,
            queue_max: DEFAULT_QUEUE_MAX,
            multiplex_timeout: DEFAULT_MULTIPLEX_TIMEOUT,
        }
    }
}

/// Shared runtime configuration with lock-free readers.
pub struct RuntimeConfig {
    core: ArcSwap<CoreConfig>,
    /// Free-form key/value overrides, e.g. module parameters.
    values: DashMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

impl RuntimeConfig {
    pub fn new(core: CoreConfig) -> Self {
        Self {
            core: ArcSwap::from_pointee(core),
            values: DashMap::new(),
        }
    }

    /// Current core configuration snapshot.
    pub fn core(&self) -> Arc<CoreConfig> {
        self.core.load_full()
    }

    /// Replace the core configuration atomically.
    pub fn set_core(&self, core: CoreConfig) {
        self.core.store(Arc::new(core));
    }

    pub fn set_value(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|entry| entry.value().clone())
    }
}

// =======================================================================
// INI grammar
// =======================================================================

/// A parsed INI document: section name to key/value pairs, both in file
/// order of last occurrence.
pub type IniDocument = BTreeMap<String, BTreeMap<String, String>>;

/// Parse the minimal INI grammar: `[section]` headers and `key=value`
/// lines. `#` starts a comment; blank lines are skipped. Keys outside a
/// section and malformed lines are errors.
pub fn parse_ini(text: &str) -> Result<IniDocument, crate::Error> {
    let mut doc = IniDocument::new();
    let mut current: Option<String> = None;

    for (lineno, raw) in text.lines().enumerate() {
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim();
            if name.is_empty() {
                return Err(crate::Error::Config(format!(
                    "line {}: empty section name",
                    lineno + 1
                )));
            }
            doc.entry(name.to_string()).or_default();
            current = Some(name.to_string());
        } else if let Some((key, value)) = line.split_once('=') {
            let Some(section) = &current else {
                return Err(crate::Error::Config(format!(
                    "line {}: key outside a section",
                    lineno + 1
                )));
            };
            doc.get_mut(section)
                .expect("section entry created on header")
                .insert(key.trim().to_string(), value.trim().to_string());
        } else {
            return Err(crate::Error::Config(format!(
                "line {}: expected [section] or key=value",
                lineno + 1
            )));
        }
    }
    Ok(doc)
}
