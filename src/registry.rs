//! Dispatch tables consulted for every incoming notification.
//!
//! | table | keyed by | invoked with | condition |
//! |---|---|---|---|
//! | command functions | command word | words of the message + full record | first word matches |
//! | command parsers | command word | full record | first word matches |
//! | parsers | handler name | full record | always |
//! | shell commands | command word | whole message text, through the shell | first word matches |
//! | shell aliases | alias word | configured command line, through the shell | first word matches |
//!
//! Registration never fails; registering a name again replaces the earlier
//! entry in place. Entries are never removed. Parsers run in registration order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::Result;

use crate::config::Config;
use crate::notification::Notification;
use crate::shell::CommandLine;

/// Handler receiving the message words (command word first) and the full record.
pub type CommandFn = Box<dyn FnMut(&[String], &Notification) -> Result<()>>;

/// Handler receiving the full record.
pub type ParserFn = Box<dyn FnMut(&Notification) -> Result<()>>;

/// First whitespace-separated word of `name`, if any.
fn first_word(name: &str) -> Option<String> {
    name.split_whitespace().next().map(str::to_string)
}

fn names<T>(entries: &[(String, T)]) -> Vec<&str> {
    entries.iter().map(|(name, _)| name.as_str()).collect()
}

fn upsert<T>(entries: &mut Vec<(String, T)>, name: String, value: T) {
    match entries.iter_mut().find(|(existing, _)| *existing == name) {
        Some(entry) => entry.1 = value,
        None => entries.push((name, value)),
    }
}

/// The four dispatch tables plus the shell-command allow list.
#[derive(Default)]
pub struct Registry {
    command_functions: Vec<(String, CommandFn)>,
    command_parsers: Vec<(String, ParserFn)>,
    parsers: Vec<(String, ParserFn)>,
    shell_commands: BTreeSet<String>,
    shell_aliases: BTreeMap<String, CommandLine>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("command_functions", &names(&self.command_functions))
            .field("command_parsers", &names(&self.command_parsers))
            .field("parsers", &names(&self.parsers))
            .field("shell_commands", &self.shell_commands)
            .field("shell_aliases", &self.shell_aliases)
            .finish()
    }
}

impl Registry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the shell commands and aliases the operator configured.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for command in &config.shell_commands {
            registry.add_shell_command(command);
        }
        for (alias, command_line) in &config.shell_aliases {
            registry.add_shell_alias(alias, command_line.clone());
        }
        registry
    }

    /// Run `handler` when a message starts with `name`.
    pub fn add_command_function<F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: FnMut(&[String], &Notification) -> Result<()> + 'static,
    {
        if let Some(name) = first_word(name) {
            upsert(&mut self.command_functions, name, Box::new(handler));
        }
        self
    }

    /// Run `handler` with the full record when a message starts with `name`.
    pub fn add_command_parser<F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: FnMut(&Notification) -> Result<()> + 'static,
    {
        if let Some(name) = first_word(name) {
            upsert(&mut self.command_parsers, name, Box::new(handler));
        }
        self
    }

    /// Run `handler` for every message. `name` only identifies the entry.
    pub fn add_parser<F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: FnMut(&Notification) -> Result<()> + 'static,
    {
        upsert(&mut self.parsers, name.to_string(), Box::new(handler));
        self
    }

    /// Allow messages starting with the first word of `command` to run through the shell.
    pub fn add_shell_command(&mut self, command: &str) -> &mut Self {
        match first_word(command) {
            Some(word) => {
                log::warn!("[registry] Shell command '{word}' enabled: message text will reach the shell");
                self.shell_commands.insert(word);
            }
            None => log::warn!("[registry] Ignoring empty shell command"),
        }
        self
    }

    /// Run `command_line` when a message starts with the first word of `alias`.
    pub fn add_shell_alias(&mut self, alias: &str, command_line: impl Into<CommandLine>) -> &mut Self {
        match first_word(alias) {
            Some(word) => {
                self.shell_aliases.insert(word, command_line.into());
            }
            None => log::warn!("[registry] Ignoring empty shell alias"),
        }
        self
    }

    pub(crate) fn command_function_mut(&mut self, name: &str) -> Option<&mut CommandFn> {
        self.command_functions
            .iter_mut()
            .find(|(existing, _)| existing == name)
            .map(|(_, handler)| handler)
    }

    pub(crate) fn command_parser_mut(&mut self, name: &str) -> Option<&mut ParserFn> {
        self.command_parsers
            .iter_mut()
            .find(|(existing, _)| existing == name)
            .map(|(_, handler)| handler)
    }

    pub(crate) fn parsers_mut(&mut self) -> impl Iterator<Item = (&str, &mut ParserFn)> {
        self.parsers
            .iter_mut()
            .map(|(name, handler)| (name.as_str(), handler))
    }

    /// Returns `true` if `word` is an allowed shell command.
    #[must_use]
    pub fn is_shell_command(&self, word: &str) -> bool {
        self.shell_commands.contains(word)
    }

    /// Command line registered for `alias`.
    #[must_use]
    pub fn shell_alias(&self, alias: &str) -> Option<&CommandLine> {
        self.shell_aliases.get(alias)
    }
}
