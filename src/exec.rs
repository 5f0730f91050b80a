//! Subprocess execution.
//!
//! Everything in the engine that spawns a process (compiler invocations and
//! the loader's self-rebuild) goes through [`CommandRunner`], so tests can
//! substitute a runner that never touches a real toolchain.

use std::io;
use std::process::Command;

/// Captured result of one finished process.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

pub trait CommandRunner: Send + Sync {
    /// Runs `command[0]` with the remaining elements as arguments and waits for it.
    ///
    /// Only spawn failures are errors; a non-zero exit is reported through
    /// [`CommandOutput::code`].
    fn execute(&self, command: &[String]) -> io::Result<CommandOutput>;
}

/// Runs commands as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn execute(&self, command: &[String]) -> io::Result<CommandOutput> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        let output = Command::new(program).args(args).output()?;

        Ok(CommandOutput {
            // Killed by a signal: no exit code, treat as failure.
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Renders a command line for display (verbose output, compile_commands.json).
pub fn display_command(command: &[String]) -> String {
    command
        .iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("\"{}\"", arg.replace('"', "\\\""))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
