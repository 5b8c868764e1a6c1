// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HGate - High-performance MySQL/MariaDB Proxy Core
//!
//! The concurrency and routing substrate of a database proxy that sits
//! between client applications and a replicated set of MariaDB/MySQL
//! backends, presenting a single logical endpoint.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                          Clients                                   |
//! +--------------------------------------------------------------------+
//! |   Listener (round-robin over desired workers)                      |
//! +--------------------------------------------------------------------+
//! |   Routing workers: poll loop | sessions | timers | pools           |
//! |   Session pipeline: protocol -> filters -> router -> backends      |
//! +--------------------------------------------------------------------+
//! |   Main worker: tasks | ticks | rebalancing | thread reconfig       |
//! |   Propagator: copy-on-write config snapshots, total order          |
//! +--------------------------------------------------------------------+
//! |                         Backend servers                            |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`engine::Workers`] | The routing worker set with stable indices |
//! | [`engine::MainWorker`] | Control-plane thread: tasks, ticks, scaling |
//! | [`session::Session`] | One client connection and its pipeline |
//! | [`pool::PoolGroup`] | Per-worker backend connection pools |
//! | [`shared::GcUpdater`] | Copy-on-write shared-state propagator |
//! | [`routing::Router`] | Pluggable routing strategy contract |
//!
//! ## Modules Overview
//!
//! - [`protocol`] - MySQL packet framing, classification, canonicalisation
//! - [`engine`] - routing workers, main worker, scaling, rebalancing
//! - [`session`] - session lifecycle, history, transaction replay
//! - [`pool`] - connection pooling and admission control
//! - [`shared`] - the shared-state propagator
//! - [`routing`] - router and filter contracts
//! - [`command`] - module command registry
//! - [`admin`] - JSON shapes for the admin surface

/// Admin-surface snapshots and JSON rendering.
pub mod admin;
/// Module command registry dispatched from the admin boundary.
pub mod command;
/// Global configuration: constants, runtime config, INI grammar.
pub mod config;
/// Routing workers, main worker, scaling, rebalancing, indexed storage.
pub mod engine;
/// Environment-derived resource limits (cgroup v1/v2).
pub mod limits;
/// Listening and outbound socket setup.
pub mod listener;
/// Logging backend behind the `log` facade.
pub mod logging;
/// Backend connection pooling and admission control.
pub mod pool;
/// MySQL/MariaDB wire protocol.
pub mod protocol;
/// Router and filter contracts.
pub mod routing;
/// Backend server entity.
pub mod server;
/// Client sessions.
pub mod session;
/// Copy-on-write shared-state propagator.
pub mod shared;

pub use engine::{MainWorker, MainWorkerConfig, Workers};
pub use server::{Server, ServerAddress, ServerId};
pub use session::{Session, SessionConfig, SessionState};

use std::fmt;
use std::sync::Arc;

/// HGate version string.
pub const VERSION: &str = "0.2.0";

/// Errors returned by HGate core operations.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration errors - rejected at the admin boundary, never
    // reaching a routing worker
    // ========================================================================
    /// Malformed configuration input.
    Config(String),
    /// Thread count outside `1..=N_MAX`.
    InvalidThreadCount(usize),
    /// A command with this `(domain, identifier)` already exists.
    CommandExists(String, String),

    // ========================================================================
    // Protocol errors
    // ========================================================================
    /// Malformed packet, unknown command or truncated payload.
    Protocol(protocol::ParseError),

    // ========================================================================
    // Backend errors
    // ========================================================================
    /// No candidate backend was usable.
    NoBackendAvailable,
    /// Write attempted on an endpoint without a connection.
    BackendNotConnected(ServerId),

    // ========================================================================
    // Resource errors
    // ========================================================================
    /// Underlying I/O failure (socket, poll instance, fd exhaustion).
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(message) => write!(f, "configuration error: {message}"),
            Error::InvalidThreadCount(count) => write!(
                f,
                "invalid thread count {count}; expected 1..={}",
                engine::N_MAX
            ),
            Error::CommandExists(domain, id) => {
                write!(f, "command already registered: {domain}::{id}")
            }
            Error::Protocol(error) => write!(f, "protocol error: {error}"),
            Error::NoBackendAvailable => write!(f, "no backend server available"),
            Error::BackendNotConnected(server) => {
                write!(f, "no connection to {server}")
            }
            Error::Io(error) => write!(f, "i/o error: {error}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(error) => Some(error),
            Error::Protocol(error) => Some(error),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<protocol::ParseError> for Error {
    fn from(error: protocol::ParseError) -> Self {
        Error::Protocol(error)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The assembled core: worker set, main worker, command registry.
///
/// Lifecycle: [`Core::init`] builds everything, [`Core::start`] brings
/// the control plane up, [`Core::stop`] shuts the threads down. Each
/// phase is idempotent at its boundary.
pub struct Core {
    workers: Arc<Workers>,
    main_worker: MainWorker,
    commands: Arc<command::CommandRegistry>,
    runtime_config: Arc<config::RuntimeConfig>,
}

impl Core {
    /// Build the core from a configuration. Nothing runs yet besides the
    /// worker threads' idle loops.
    pub fn init(core_config: config::CoreConfig) -> Result<Self> {
        let workers = Arc::new(Workers::new(
            core_config.threads,
            core_config.rebalance_window,
        )?);
        let main_worker = MainWorker::new(
            Arc::clone(&workers),
            MainWorkerConfig {
                rebalance_period: core_config.rebalance_period,
                rebalance_threshold: core_config.rebalance_threshold,
            },
        );
        let runtime_config = Arc::new(config::RuntimeConfig::new(core_config));
        Ok(Self {
            workers,
            main_worker,
            commands: Arc::new(command::CommandRegistry::new()),
            runtime_config,
        })
    }

    /// Start the control plane.
    pub fn start(&mut self) {
        self.main_worker.start();
        log::info!("[CORE] hgate {VERSION} started with {} workers", self.workers.n_created());
    }

    /// Stop the control plane and all workers.
    pub fn stop(&mut self) {
        self.main_worker.stop();
        self.workers.shutdown();
        log::info!("[CORE] stopped");
    }

    pub fn workers(&self) -> &Arc<Workers> {
        &self.workers
    }

    pub fn main_worker(&self) -> &MainWorker {
        &self.main_worker
    }

    pub fn commands(&self) -> &Arc<command::CommandRegistry> {
        &self.commands
    }

    pub fn runtime_config(&self) -> &Arc<config::RuntimeConfig> {
        &self.runtime_config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_lifecycle() {
        let mut core = Core::init(config::CoreConfig {
            threads: 2,
            ..config::CoreConfig::default()
        })
        .unwrap();

        core.start();
        core.start(); // idempotent
        assert_eq!(core.workers().n_created(), 2);

        core.stop();
        core.stop(); // idempotent
        assert!(core.workers().shutdown_complete());
    }

    #[test]
    fn test_error_display() {
        let error = Error::InvalidThreadCount(0);
        assert!(error.to_string().contains("invalid thread count"));

        let error = Error::NoBackendAvailable;
        assert!(error.to_string().contains("no backend"));
    }
}
