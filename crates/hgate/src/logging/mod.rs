// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logging backend behind the `log` facade.
//!
//! The crate logs through the standard `log` macros everywhere;
//! `init_logger` installs an [`Output`] (console or file) as the global
//! sink. Compiled out entirely when the `logging` feature is disabled -
//! the facade macros then compile to no-ops because no logger is set.

#[cfg(feature = "logging")]
mod output;

#[cfg(feature = "logging")]
pub use output::{ConsoleOutput, FileOutput, LogLevel, Output};

#[cfg(feature = "logging")]
mod facade {
    use super::{LogLevel, Output};
    use std::sync::Arc;
    use std::sync::OnceLock;

    static LOGGER: OnceLock<FacadeLogger> = OnceLock::new();

    pub(super) struct FacadeLogger {
        output: Arc<dyn Output>,
    }

    impl log::Log for FacadeLogger {
        fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
            true
        }

        fn log(&self, record: &log::Record<'_>) {
            let level = match record.level() {
                log::Level::Error => LogLevel::Error,
                log::Level::Warn => LogLevel::Warning,
                log::Level::Info => LogLevel::Info,
                log::Level::Debug => LogLevel::Debug,
                log::Level::Trace => LogLevel::Trace,
            };
            let _ = self.output.write(level, &format!("{}", record.args()));
        }

        fn flush(&self) {
            let _ = self.output.flush();
        }
    }

    /// Install the global logger. Later calls are ignored; the first
    /// output wins.
    pub fn init_logger(output: Arc<dyn Output>, max_level: LogLevel) {
        let logger = LOGGER.get_or_init(|| FacadeLogger { output });
        if log::set_logger(logger).is_ok() {
            log::set_max_level(match max_level {
                LogLevel::Trace => log::LevelFilter::Trace,
                LogLevel::Debug => log::LevelFilter::Debug,
                LogLevel::Info => log::LevelFilter::Info,
                LogLevel::Warning => log::LevelFilter::Warn,
                LogLevel::Error => log::LevelFilter::Error,
            });
        }
    }

    /// Flush the global logger.
    pub fn flush_logger() {
        if let Some(logger) = LOGGER.get() {
            use log::Log;
            logger.flush();
        }
    }
}

#[cfg(feature = "logging")]
pub use facade::{flush_logger, init_logger};
