//! Shell-out seam for platform commands.

use std::process::Command;
use tracing::debug;

/// Runs an external program and returns its stdout.
///
/// Errors carry a human-readable description (spawn failure or stderr).
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`.
    fn run(&self, program: &str, args: &[&str]) -> Result<String, String>;
}

/// Runs commands with [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, String> {
        let cmd_str = format!("{} {}", program, args.join(" "));
        debug!("Running: {}", cmd_str);

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| format!("{}: {}", cmd_str, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("{}: {}", cmd_str, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
