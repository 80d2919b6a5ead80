//! Runner for the external command-line tools the substrate is driven with.

use crate::error::{Result, VmError};
use tokio::process::Command;

/// Captured result of a tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Whether the tool exited with status 0
    pub success: bool,
    /// Exit code, if the tool was not killed by a signal
    pub code: Option<i32>,
    /// Standard output, lossily decoded
    pub stdout: String,
    /// Standard error, lossily decoded
    pub stderr: String,
}

/// Spawns substrate tools, optionally through `sudo`.
#[derive(Debug, Clone, Default)]
pub struct ToolRunner {
    sudo: bool,
}

impl ToolRunner {
    /// Create a runner. With `sudo`, every program is prefixed with `sudo`.
    pub fn new(sudo: bool) -> Self {
        Self { sudo }
    }

    /// Build the command. The child is killed if the caller stops waiting
    /// on it, so a timed-out step leaves nothing running behind it.
    fn command(&self, program: &str, args: &[&str]) -> Command {
        let mut cmd = if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.args(args).kill_on_drop(true);
        cmd
    }

    /// Run a tool and capture its output regardless of exit status.
    pub async fn output(&self, program: &str, args: &[&str]) -> Result<ToolOutput> {
        let line = format!("{} {}", program, args.join(" "));
        tracing::debug!(command = %line, "Running");

        let output = self
            .command(program, args)
            .output()
            .await
            .map_err(|source| VmError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let result = ToolOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };
        tracing::trace!(command = %line, code = ?result.code, "Finished");
        Ok(result)
    }

    /// Run a tool and fail unless it exits successfully. Returns stdout.
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = self.output(program, args).await?;
        if !output.success {
            return Err(VmError::Command {
                program: format!("{} {}", program, args.join(" ")),
                status: output
                    .code
                    .map(|c| format!("exit code {c}"))
                    .unwrap_or_else(|| "killed by signal".to_string()),
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }
}
