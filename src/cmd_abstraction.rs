//! Command execution abstraction for testability.
//!
//! Firewall changes are made by running configured command templates. This
//! module renders those templates and runs them through a trait so tests can
//! substitute a mock executor instead of touching the real packet filter.

use anyhow::{bail, Result};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

#[cfg(test)]
use mockall::automock;

const WAIT_POLL: Duration = Duration::from_millis(10);

/// Output from command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// The exit code, if available
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Short human-readable description of a failed run.
    pub fn failure_summary(&self) -> String {
        let code = self
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit {}", code)
        } else {
            format!("exit {}: {}", code, crate::utils::truncate(stderr, 200))
        }
    }
}

/// A command outlived its deadline and was killed.
#[derive(Debug, thiserror::Error)]
#[error("command killed after {0:?} without exiting")]
pub struct CommandTimedOut(pub Duration);

/// Trait for command execution, allowing dependency injection for testing.
///
/// The real implementation spawns processes, while tests use
/// `MockCommandExecutor` to control command behavior.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    /// Execute `cmd` with `args` and capture its output.
    ///
    /// An `Err` means the process could not be started or was killed at its
    /// deadline; a non-zero exit is reported through `CommandOutput::success`.
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Real implementation of CommandExecutor that runs actual system commands.
///
/// With a deadline set, a child that has not exited in time is killed and
/// reaped before `execute` returns [`CommandTimedOut`].
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor {
    deadline: Option<Duration>,
}

impl RealCommandExecutor {
    /// Create a new RealCommandExecutor
    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// Kill commands that run longer than `deadline`.
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    fn wait(&self, mut child: Child) -> Result<std::process::Output> {
        let Some(deadline) = self.deadline else {
            return Ok(child.wait_with_output()?);
        };

        let until = Instant::now() + deadline;
        loop {
            if child.try_wait()?.is_some() {
                return Ok(child.wait_with_output()?);
            }
            if Instant::now() >= until {
                // kill() only fails once the child has exited; wait() reaps either way
                let _ = child.kill();
                let _ = child.wait();
                return Err(CommandTimedOut(deadline).into());
            }
            std::thread::sleep(WAIT_POLL);
        }
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let output = self.wait(child)?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

/// Expand a command template into a program and its arguments.
///
/// The template is split on whitespace first and placeholders are substituted
/// per argument, so a substituted value can never introduce extra arguments.
/// `vars` holds `(name, value)` pairs matched against `{name}`. An argument
/// that consists solely of a placeholder whose value is empty is dropped.
///
/// Words between `[` and `]` form an optional group, kept only when every
/// placeholder inside it has a value:
/// `iptables -I INPUT -s {addr} [-p tcp -m multiport --dports {ports}] -j DROP`
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> Result<(String, Vec<String>)> {
    let mut words = template.split_whitespace();
    let program = match words.next() {
        Some(p) if !p.starts_with('[') => p.to_string(),
        Some(_) => bail!("Command template cannot start with an optional group"),
        None => bail!("Empty command template"),
    };

    let mut args = Vec::new();
    let mut group: Option<(Vec<String>, bool)> = None;
    for word in words {
        let opens = word.starts_with('[');
        let closes = word.ends_with(']');
        let inner = word.trim_start_matches('[').trim_end_matches(']');

        if opens && group.is_some() {
            bail!("Nested optional group in command template");
        }
        if opens {
            group = Some((Vec::new(), true));
        }

        let (rendered, missing) = render_word(inner, vars);
        match group.as_mut() {
            Some((words, complete)) => {
                *complete &= !missing;
                if !inner.is_empty() {
                    words.push(rendered);
                }
            }
            None if closes => bail!("Unbalanced ']' in command template"),
            None => {
                if !(missing && is_sole_placeholder(inner)) {
                    args.push(rendered);
                }
            }
        }

        if closes {
            if let Some((words, complete)) = group.take() {
                if complete {
                    args.extend(words);
                }
            }
        }
    }
    if group.is_some() {
        bail!("Unclosed '[' in command template");
    }

    Ok((program, args))
}

/// Substitute placeholders in one word. The flag is set when any placeholder
/// in the word had an empty value.
fn render_word(word: &str, vars: &[(&str, &str)]) -> (String, bool) {
    let mut rendered = word.to_string();
    let mut missing = false;
    for (name, value) in vars {
        let placeholder = format!("{{{}}}", name);
        if rendered.contains(&placeholder) {
            missing |= value.is_empty();
            rendered = rendered.replace(&placeholder, value);
        }
    }
    (rendered, missing)
}

fn is_sole_placeholder(word: &str) -> bool {
    word.len() > 2 && word.starts_with('{') && word.ends_with('}') && !word[1..].contains('{')
}
