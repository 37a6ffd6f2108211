//! Shell execution for notification-triggered commands.
//!
//! # Security
//!
//! Shell commands run the *entire notification text* through `sh -c`
//! (`cmd /C` on Windows). Anyone able to push a notification to the device
//! can therefore inject arbitrary shell syntax after a registered command
//! word. Only command words and aliases the operator registered explicitly
//! are reachable; nothing else in a message ever reaches a shell. Do not
//! register shell commands unless every sender is trusted.
//!
//! Aliases are safer: they run the configured command line and ignore the
//! rest of the message.

use std::process::{Child, Command};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A line handed verbatim to the platform shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellLine(String);

impl ShellLine {
    /// Wrap a shell line.
    pub fn new(line: impl Into<String>) -> Self {
        Self(line.into())
    }

    /// The line as passed to the shell.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShellLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Command line configured for a shell alias.
///
/// Either a single string (split on whitespace into program + args) or an
/// explicit argument list. Both forms reach the shell as quoted arguments,
/// so shell syntax inside an alias is passed literally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    /// Whitespace-separated command line.
    Line(String),
    /// Program followed by its arguments.
    Args(Vec<String>),
}

impl CommandLine {
    /// Program and arguments.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        match self {
            Self::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            Self::Args(args) => args.clone(),
        }
    }

    /// Shell form: every argument of [`Self::argv`], quoted.
    #[must_use]
    pub fn to_shell_line(&self) -> ShellLine {
        ShellLine::new(
            self.argv()
                .iter()
                .map(|arg| quote_arg(arg))
                .collect::<Vec<_>>()
                .join(" "),
        )
    }
}

impl From<&str> for CommandLine {
    fn from(line: &str) -> Self {
        Self::Line(line.to_string())
    }
}

impl From<String> for CommandLine {
    fn from(line: String) -> Self {
        Self::Line(line)
    }
}

impl From<Vec<String>> for CommandLine {
    fn from(args: Vec<String>) -> Self {
        Self::Args(args)
    }
}

impl From<&[&str]> for CommandLine {
    fn from(args: &[&str]) -> Self {
        Self::Args(args.iter().map(|a| (*a).to_string()).collect())
    }
}

/// POSIX single-quote `arg` unless it only holds shell-inert characters.
fn quote_arg(arg: &str) -> String {
    let inert = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if inert {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Executes shell lines on behalf of the dispatcher.
pub trait CommandRunner {
    /// Start `line` through the shell. Must not wait for it to finish.
    fn run(&mut self, line: &ShellLine) -> Result<()>;
}

/// Runs lines through the platform shell as detached children.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

impl ShellRunner {
    fn command(line: &ShellLine) -> Command {
        #[cfg(windows)]
        {
            let mut command = Command::new("cmd");
            command.args(["/C", line.as_str()]);
            command
        }

        #[cfg(not(windows))]
        {
            let mut command = Command::new("sh");
            command.args(["-c", line.as_str()]);
            command
        }
    }
}

impl CommandRunner for ShellRunner {
    fn run(&mut self, line: &ShellLine) -> Result<()> {
        let child = Self::command(line)
            .spawn()
            .with_context(|| format!("Failed to spawn shell for: {line}"))?;
        log::info!("[shell] Started pid {}: {}", child.id(), line);
        reap(child);
        Ok(())
    }
}

/// Wait for `child` off-thread so it never lingers as a zombie.
fn reap(mut child: Child) {
    std::thread::spawn(move || match child.wait() {
        Ok(status) if status.success() => {
            log::debug!("[shell] pid {} exited successfully", child.id());
        }
        Ok(status) => log::warn!("[shell] pid {} exited with {}", child.id(), status),
        Err(e) => log::warn!("[shell] Failed to wait for pid {}: {}", child.id(), e),
    });
}
