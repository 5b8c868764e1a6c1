// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Proxy-scoped session variables.
//!
//! Variables of the form `@maxscale.<scope>.<name>` are intercepted by
//! the proxy instead of being sent to a backend. Subsystems register a
//! handler per variable; setting the variable from the client invokes the
//! handler, which parses the value string and either accepts it or
//! returns a user-facing error string.

use std::collections::HashMap;

/// Handler invoked with the raw value string. `Ok(())` accepts the value;
/// `Err(message)` is returned to the client verbatim.
pub type VariableHandler = Box<dyn FnMut(&str) -> Result<(), String> + Send>;

/// Per-session variable registry.
#[derive(Default)]
pub struct SessionVariables {
    handlers: HashMap<String, VariableHandler>,
}

impl SessionVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `name`. Names are case-insensitive and must
    /// start with `@maxscale.`. Returns `false` when the name is invalid
    /// or already taken.
    pub fn add_variable(&mut self, name: &str, handler: VariableHandler) -> bool {
        let key = name.to_ascii_lowercase();
        if !key.starts_with("@maxscale.") {
            return false;
        }
        if self.handlers.contains_key(&key) {
            return false;
        }
        self.handlers.insert(key, handler);
        true
    }

    /// Dispatch `SET @maxscale.<...> = value`. Returns `None` on success,
    /// the handler's error string on rejection, or an unknown-variable
    /// error when nothing is registered under the name.
    pub fn set_variable_value(&mut self, name: &str, value: &str) -> Option<String> {
        let key = name.to_ascii_lowercase();
        match self.handlers.get_mut(&key) {
            Some(handler) => handler(value.trim()).err(),
            None => Some(format!("Unknown variable: {name}")),
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for SessionVariables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionVariables")
            .field("registered", &self.handlers.len())
            .finish()
    }
}
