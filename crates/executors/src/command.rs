use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandSpecError {
    #[error("command line cannot be parsed: {0}")]
    InvalidCommandLine(String),
    #[error("command is empty after parsing")]
    EmptyCommand,
}

/// Everything needed to spawn one agent subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
            timeout: None,
        }
    }

    /// Build from a full command line (`"npx some-agent --json"`), splitting
    /// with shell-style word rules but never invoking a shell.
    pub fn from_command_line(
        line: &str,
        cwd: impl Into<PathBuf>,
    ) -> Result<Self, CommandSpecError> {
        let mut parts = shlex::split(line)
            .ok_or_else(|| CommandSpecError::InvalidCommandLine(line.to_string()))?;
        if parts.is_empty() {
            return Err(CommandSpecError::EmptyCommand);
        }
        let program = parts.remove(0);
        Ok(Self {
            program,
            args: parts,
            cwd: cwd.into(),
            env: HashMap::new(),
            timeout: None,
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn envs(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_command_lines_with_quoting() {
        let spec = CommandSpec::from_command_line("agent --model 'my model' run", "/tmp").unwrap();
        assert_eq!(spec.program, "agent");
        assert_eq!(spec.args, vec!["--model", "my model", "run"]);
    }

    #[test]
    fn rejects_empty_command_lines() {
        assert!(matches!(
            CommandSpec::from_command_line("", "/tmp"),
            Err(CommandSpecError::EmptyCommand) | Err(CommandSpecError::InvalidCommandLine(_))
        ));
    }
}
