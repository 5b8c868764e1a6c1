// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Module command registry.
//!
//! Modules register named introspection and control commands that the
//! admin boundary dispatches by `(domain, identifier)`. Input tokens are
//! strings; the registry resolves each to its declared kind by looking up
//! the corresponding named entity or parsing the literal. The command
//! function writes a JSON-API-shaped result; errors land in a
//! thread-local error buffer.

use crate::server::Server;
use dashmap::DashMap;
use std::cell::RefCell;
use std::sync::Arc;

/// Passive commands only display data; active commands modify it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Passive,
    Active,
}

/// Declared kind of one command argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    None,
    String,
    Boolean,
    Service,
    Server,
    Session,
    Dcb,
    Monitor,
    Filter,
}

/// One declared argument.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub kind: ArgKind,
    pub optional: bool,
    /// The named module's name must match the command's domain.
    pub name_matches_domain: bool,
    pub description: String,
}

impl ArgSpec {
    pub fn required(kind: ArgKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            optional: false,
            name_matches_domain: false,
            description: description.into(),
        }
    }

    pub fn optional(kind: ArgKind, description: impl Into<String>) -> Self {
        Self {
            optional: true,
            ..Self::required(kind, description)
        }
    }
}

/// A resolved argument value.
#[derive(Debug, Clone)]
pub enum ArgValue {
    /// A missing optional argument.
    None,
    String(String),
    Boolean(bool),
    Service(String),
    Server(Arc<Server>),
    Session(u64),
    Dcb(u64),
    Monitor(String),
    Filter(String),
}

/// Looks up named entities while parsing arguments. The admin boundary
/// provides the process-wide implementation.
pub trait EntityResolver: Send + Sync {
    fn server(&self, name: &str) -> Option<Arc<Server>>;
    fn session_exists(&self, id: u64) -> bool;
    fn service_exists(&self, name: &str) -> bool;
    fn monitor_exists(&self, name: &str) -> bool;
    fn filter_exists(&self, name: &str) -> bool;
}

/// The command entry point: receives the parsed argument vector, returns
/// a JSON document for the admin surface or an error message.
pub type CommandFn = Box<dyn Fn(&[ArgValue]) -> Result<Option<String>, String> + Send + Sync>;

/// One registered command.
pub struct Command {
    pub domain: String,
    pub identifier: String,
    pub command_type: CommandType,
    pub args: Vec<ArgSpec>,
    pub description: String,
    func: CommandFn,
}

impl Command {
    /// Number of required leading arguments.
    fn min_args(&self) -> usize {
        self.args.iter().take_while(|spec| !spec.optional).count()
    }
}

thread_local! {
    static ERROR_BUFFER: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Set the thread-local command error.
pub fn set_error(message: impl Into<String>) {
    ERROR_BUFFER.with(|buffer| *buffer.borrow_mut() = Some(message.into()));
}

/// Take the last command error recorded on this thread.
pub fn take_error() -> Option<String> {
    ERROR_BUFFER.with(|buffer| buffer.borrow_mut().take())
}

/// The process-wide command registry.
///
/// Registrations complete before workers start; afterwards the registry
/// is read-only, so lookups need no coordination.
#[derive(Default)]
pub struct CommandRegistry {
    commands: DashMap<(String, String), Arc<Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command; `(domain, identifier)` must be unique.
    pub fn register(
        &self,
        domain: impl Into<String>,
        identifier: impl Into<String>,
        command_type: CommandType,
        func: CommandFn,
        args: Vec<ArgSpec>,
        description: impl Into<String>,
    ) -> Result<(), crate::Error> {
        let domain = domain.into().to_ascii_lowercase();
        let identifier = identifier.into().to_ascii_lowercase();
        let key = (domain.clone(), identifier.clone());
        if self.commands.contains_key(&key) {
            return Err(crate::Error::CommandExists(domain, identifier));
        }
        self.commands.insert(
            key,
            Arc::new(Command {
                domain,
                identifier,
                command_type,
                args,
                description: description.into(),
                func,
            }),
        );
        Ok(())
    }

    pub fn find(&self, domain: &str, identifier: &str) -> Option<Arc<Command>> {
        let key = (
            domain.to_ascii_lowercase(),
            identifier.to_ascii_lowercase(),
        );
        self.commands.get(&key).map(|entry| Arc::clone(&entry))
    }

    /// Commands of one domain, for the admin listing.
    pub fn domain_commands(&self, domain: &str) -> Vec<Arc<Command>> {
        let domain = domain.to_ascii_lowercase();
        self.commands
            .iter()
            .filter(|entry| entry.key().0 == domain)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Parse raw tokens against the command's argument spec.
    pub fn parse_args(
        &self,
        command: &Command,
        tokens: &[&str],
        resolver: &dyn EntityResolver,
    ) -> Result<Vec<ArgValue>, String> {
        if tokens.len() < command.min_args() {
            return Err(format!(
                "Command '{}::{}' requires at least {} arguments, got {}",
                command.domain,
                command.identifier,
                command.min_args(),
                tokens.len()
            ));
        }
        if tokens.len() > command.args.len() {
            return Err(format!(
                "Command '{}::{}' takes at most {} arguments, got {}",
                command.domain,
                command.identifier,
                command.args.len(),
                tokens.len()
            ));
        }

        let mut values = Vec::with_capacity(command.args.len());
        for (index, spec) in command.args.iter().enumerate() {
            match tokens.get(index) {
                Some(token) => values.push(resolve_token(command, spec, token, resolver)?),
                // Missing optional arguments are passed as None.
                None => values.push(ArgValue::None),
            }
        }
        Ok(values)
    }

    /// Parse and execute in one step. On error the thread-local error
    /// buffer is set as well.
    pub fn execute(
        &self,
        domain: &str,
        identifier: &str,
        tokens: &[&str],
        resolver: &dyn EntityResolver,
    ) -> Result<Option<String>, String> {
        let Some(command) = self.find(domain, identifier) else {
            let message = format!("Command not found: {domain}::{identifier}");
            set_error(message.clone());
            return Err(message);
        };
        let args = self.parse_args(&command, tokens, resolver).map_err(|e| {
            set_error(e.clone());
            e
        })?;
        (command.func)(&args).map_err(|e| {
            set_error(e.clone());
            e
        })
    }
}

fn resolve_token(
    command: &Command,
    spec: &ArgSpec,
    token: &str,
    resolver: &dyn EntityResolver,
) -> Result<ArgValue, String> {
    if spec.name_matches_domain && !token.eq_ignore_ascii_case(&command.domain) {
        return Err(format!(
            "Argument '{token}' must match the domain '{}'",
            command.domain
        ));
    }
    match spec.kind {
        ArgKind::None => Ok(ArgValue::None),
        ArgKind::String => Ok(ArgValue::String(token.to_string())),
        ArgKind::Boolean => match token.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(ArgValue::Boolean(true)),
            "false" | "no" | "off" | "0" => Ok(ArgValue::Boolean(false)),
            _ => Err(format!("Not a boolean: {token}")),
        },
        ArgKind::Service => {
            if resolver.service_exists(token) {
                Ok(ArgValue::Service(token.to_string()))
            } else {
                Err(format!("Service not found: {token}"))
            }
        }
        ArgKind::Server => resolver
            .server(token)
            .map(ArgValue::Server)
            .ok_or_else(|| format!("Server not found: {token}")),
        ArgKind::Session => {
            let id: u64 = token
                .parse()
                .map_err(|_| format!("Not a session id: {token}"))?;
            if resolver.session_exists(id) {
                Ok(ArgValue::Session(id))
            } else {
                Err(format!("Session not found: {id}"))
            }
        }
        ArgKind::Dcb => token
            .parse()
            .map(ArgValue::Dcb)
            .map_err(|_| format!("Not a DCB id: {token}")),
        ArgKind::Monitor => {
            if resolver.monitor_exists(token) {
                Ok(ArgValue::Monitor(token.to_string()))
            } else {
                Err(format!("Monitor not found: {token}"))
            }
        }
        ArgKind::Filter => {
            if resolver.filter_exists(token) {
                Ok(ArgValue::Filter(token.to_string()))
            } else {
                Err(format!("Filter not found: {token}"))
            }
        }
    }
}
